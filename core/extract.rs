use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::info;

use crate::config::{ConfigError, ParserConfig, PARSER_CONFIG_VERSION};
use crate::migrate::Migrator;

static BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)/\*\*\s*@ParserConfig\s*\n(.*?)\*/").expect("valid block pattern")
});

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("@ParserConfig block not found")]
    BlockNotFound,
}

/// Returns the trimmed JSON text of the first `/** @ParserConfig ... */`
/// region. The marker must be followed by a line break.
pub fn extract_block(document: &str) -> Result<String, ExtractError> {
    let caps = BLOCK_RE.captures(document).ok_or(ExtractError::BlockNotFound)?;
    let body = caps.get(1).ok_or(ExtractError::BlockNotFound)?;
    Ok(body.as_str().trim().to_string())
}

pub fn detect_version(raw: &str) -> u32 {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return 0,
    };
    value
        .get("ParserConfig")
        .and_then(|section| section.get("version"))
        .or_else(|| value.get("version"))
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

pub fn load_parser_config(
    document: &str,
    migrator: &dyn Migrator,
) -> Result<ParserConfig, ConfigError> {
    let raw = extract_block(document)?;
    let version = detect_version(&raw);

    let mut config = if version == PARSER_CONFIG_VERSION {
        ParserConfig::from_json(&raw)?
    } else if version > PARSER_CONFIG_VERSION {
        return Err(ConfigError::UnsupportedVersion {
            found: version,
            supported: PARSER_CONFIG_VERSION,
        });
    } else {
        migrator.migrate(&raw, version, PARSER_CONFIG_VERSION)?
    };

    config.normalize(None);
    info!(
        from_version = version,
        version = config.parser_config.version,
        sources = config.proxies().len(),
        outbounds = config.outbounds().len(),
        "parser config extracted"
    );
    Ok(config)
}

pub fn replace_block(document: &str, config: &ParserConfig) -> Result<String, ConfigError> {
    let caps = BLOCK_RE.captures(document).ok_or(ExtractError::BlockNotFound)?;
    let region = caps.get(0).ok_or(ExtractError::BlockNotFound)?;
    // `*/` inside a string would close the comment early; `\/` is a JSON escape.
    let body = config.to_json_pretty()?.replace("*/", "*\\/");

    let mut out = String::with_capacity(document.len() + body.len());
    out.push_str(&document[..region.start()]);
    out.push_str("/** @ParserConfig\n");
    out.push_str(&body);
    out.push_str("\n*/");
    out.push_str(&document[region.end()..]);
    Ok(out)
}
