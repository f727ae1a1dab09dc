use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use subparser::config::ParserConfig;
use subparser::extract::{load_parser_config, replace_block};
use subparser::fetch::HttpFetcher;
use subparser::generate::generate_outbounds;
use subparser::links::UriDecoder;
use subparser::loader::SourceLoader;
use subparser::migrate::LegacyMigrator;
use subparser::tags::TagRegistry;

#[derive(Parser, Debug)]
#[command(name = "subparser", version, about = "Subscription to outbound compiler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the @ParserConfig block of a config file
    Check {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print the normalized @ParserConfig block
    Extract { config: PathBuf },
    /// Fetch every source and print the generated outbound fragments
    Generate {
        config: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Rewrite the config block with a fresh last_updated
        #[arg(long)]
        stamp: bool,
    },
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    match cli.command {
        Command::Check { config, json } => handle_check(&config, json),
        Command::Extract { config } => handle_extract(&config),
        Command::Generate {
            config,
            output,
            stamp,
        } => handle_generate(&config, output.as_deref(), stamp),
    }
}

fn read_config(path: &Path) -> Result<(String, ParserConfig), String> {
    let content = fs::read_to_string(path)
        .map_err(|err| format!("failed to read {}: {}", path.display(), err))?;
    let config = load_parser_config(&content, &LegacyMigrator)
        .map_err(|err| format!("invalid config: {}", err))?;
    Ok((content, config))
}

#[derive(Serialize)]
struct CheckResponse {
    ok: bool,
    path: String,
    version: Option<u32>,
    sources: usize,
    outbounds: usize,
    error: Option<String>,
}

fn handle_check(path: &Path, json: bool) {
    let result = read_config(path);
    if json {
        let payload = match &result {
            Ok((_, config)) => CheckResponse {
                ok: true,
                path: path.display().to_string(),
                version: Some(config.parser_config.version),
                sources: config.proxies().len(),
                outbounds: config.outbounds().len(),
                error: None,
            },
            Err(err) => CheckResponse {
                ok: false,
                path: path.display().to_string(),
                version: None,
                sources: 0,
                outbounds: 0,
                error: Some(err.clone()),
            },
        };
        let json = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
        println!("{}", json);
    }

    match result {
        Ok((_, config)) => {
            if !json {
                println!(
                    "check ok: {} (version {}, {} sources, {} outbounds)",
                    path.display(),
                    config.parser_config.version,
                    config.proxies().len(),
                    config.outbounds().len()
                );
            }
        }
        Err(err) => {
            if !json {
                eprintln!("{}", err);
            }
            std::process::exit(1);
        }
    }
}

fn handle_extract(path: &Path) {
    let config = match read_config(path) {
        Ok((_, config)) => config,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };
    match config.to_json_pretty() {
        Ok(json) => println!("{}", json),
        Err(err) => {
            eprintln!("failed to render config: {}", err);
            std::process::exit(1);
        }
    }
}

fn handle_generate(path: &Path, output: Option<&Path>, stamp: bool) {
    let (content, mut config) = match read_config(path) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };

    let fetcher = match HttpFetcher::new() {
        Ok(f) => f,
        Err(err) => {
            eprintln!("failed to build http client: {}", err);
            std::process::exit(1);
        }
    };
    let loader = SourceLoader::new(fetcher, UriDecoder);
    let mut registry = TagRegistry::new();
    let mut progress = |percent: f64, message: &str| info!(percent = percent.round(), "{}", message);

    let generation = match generate_outbounds(&config, &mut registry, Some(&mut progress), &loader) {
        Ok(g) => g,
        Err(err) => {
            eprintln!("generation failed: {}", err);
            std::process::exit(1);
        }
    };

    let rendered = generation.render();
    match output {
        Some(out) => {
            if let Err(err) = fs::write(out, format!("{}\n", rendered)) {
                eprintln!("failed to write {}: {}", out.display(), err);
                std::process::exit(1);
            }
        }
        None => println!("{}", rendered),
    }
    eprintln!(
        "nodes: {}, local selectors: {}, global selectors: {}",
        generation.nodes_count, generation.local_selectors_count, generation.global_selectors_count
    );

    if stamp {
        config.normalize(Some(Utc::now()));
        let updated = match replace_block(&content, &config) {
            Ok(updated) => updated,
            Err(err) => {
                eprintln!("failed to update config block: {}", err);
                std::process::exit(1);
            }
        };
        if let Err(err) = fs::write(path, updated) {
            eprintln!("failed to write {}: {}", path.display(), err);
            std::process::exit(1);
        }
        eprintln!("config stamped: {}", path.display());
    }
}
