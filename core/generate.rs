use tracing::{info, warn};

use crate::config::ParserConfig;
use crate::emit::{node_json, selector_json};
use crate::loader::{LoadNodes, Progress};
use crate::node::Node;
use crate::tags::TagRegistry;

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("no nodes parsed from any source")]
    NoNodes,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundGeneration {
    pub fragments: Vec<String>,
    pub nodes_count: usize,
    pub local_selectors_count: usize,
    pub global_selectors_count: usize,
}

impl OutboundGeneration {
    pub fn render(&self) -> String {
        render_fragments(&self.fragments)
    }
}

pub fn render_fragments(fragments: &[String]) -> String {
    fragments.join("\n")
}

pub fn generate_outbounds(
    config: &ParserConfig,
    registry: &mut TagRegistry,
    progress: Option<&mut dyn Progress>,
    loader: &dyn LoadNodes,
) -> Result<OutboundGeneration, GenerateError> {
    let mut silent = |_: f64, _: &str| {};
    let progress: &mut dyn Progress = match progress {
        Some(progress) => progress,
        None => &mut silent,
    };

    let sources = config.proxies();
    let total = sources.len();
    progress.report(10.0, &format!("Processing {} sources...", total));

    let mut pool: Vec<Node> = Vec::new();
    let mut by_source: Vec<std::ops::Range<usize>> = Vec::with_capacity(total);
    for (index, source) in sources.iter().enumerate() {
        progress.report(
            10.0 + index as f64 * 30.0 / total as f64,
            &format!("Processing source {}/{}...", index + 1, total),
        );
        let start = pool.len();
        match loader.load(source, registry, progress, index, total) {
            Ok(nodes) => pool.extend(nodes),
            Err(err) => warn!(source = index + 1, total, error = %err, "skipping source"),
        }
        by_source.push(start..pool.len());
    }

    if pool.is_empty() {
        return Err(GenerateError::NoNodes);
    }

    progress.report(40.0, &format!("Generating JSON for {} nodes...", pool.len()));
    let mut out = OutboundGeneration::default();
    for node in &pool {
        match node_json(node) {
            Ok(fragment) => {
                out.fragments.push(fragment);
                out.nodes_count += 1;
            }
            Err(err) => warn!(tag = %node.tag, error = %err, "failed to render node"),
        }
    }

    progress.report(60.0, "Generating local selectors...");
    for (index, (source, range)) in sources.iter().zip(&by_source).enumerate() {
        if source.outbounds.is_empty() || range.is_empty() {
            continue;
        }
        let subset = &pool[range.clone()];
        for outbound in &source.outbounds {
            match selector_json(subset, outbound) {
                Ok(Some(fragment)) => {
                    out.fragments.push(fragment);
                    out.local_selectors_count += 1;
                }
                Ok(None) => {}
                Err(err) => warn!(
                    tag = %outbound.tag,
                    source = index + 1,
                    error = %err,
                    "failed to render local selector"
                ),
            }
        }
    }

    progress.report(80.0, "Generating global selectors...");
    for outbound in config.outbounds() {
        match selector_json(&pool, outbound) {
            Ok(Some(fragment)) => {
                out.fragments.push(fragment);
                out.global_selectors_count += 1;
            }
            Ok(None) => {}
            Err(err) => warn!(tag = %outbound.tag, error = %err, "failed to render global selector"),
        }
    }

    registry.log_duplicate_statistics();
    info!(
        nodes = out.nodes_count,
        local_selectors = out.local_selectors_count,
        global_selectors = out.global_selectors_count,
        "outbounds generated"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OutboundConfig, ProxySource};
    use crate::loader::LoadError;
    use crate::node::Protocol;
    use serde_json::json;

    /// Each source's `connections` are plain tags; `source == "fail"` errors.
    struct TagLoader;

    impl LoadNodes for TagLoader {
        fn load(
            &self,
            source: &ProxySource,
            registry: &mut TagRegistry,
            progress: &mut dyn Progress,
            index: usize,
            total: usize,
        ) -> Result<Vec<Node>, LoadError> {
            if source.source == "fail" {
                return Err(LoadError::Source {
                    index,
                    reason: "boom".to_string(),
                });
            }
            progress.report(20.0 + index as f64 * 50.0 / total as f64, "loading");
            Ok(source
                .connections
                .iter()
                .map(|tag| Node {
                    tag: registry.make_unique(tag),
                    server: "h".to_string(),
                    port: 443,
                    secret: "id".to_string(),
                    flow: String::new(),
                    label: tag.clone(),
                    comment: String::new(),
                    query: Vec::new(),
                    protocol: Protocol::Vless,
                    tls: None,
                })
                .collect())
        }
    }

    fn source(tags: &[&str]) -> ProxySource {
        ProxySource {
            connections: tags.iter().map(|t| t.to_string()).collect(),
            ..ProxySource::default()
        }
    }

    fn selector(tag: &str) -> OutboundConfig {
        OutboundConfig {
            tag: tag.to_string(),
            kind: "selector".to_string(),
            ..OutboundConfig::default()
        }
    }

    fn config(proxies: Vec<ProxySource>, outbounds: Vec<OutboundConfig>) -> ParserConfig {
        let mut config = ParserConfig::default();
        config.parser_config.proxies = proxies;
        config.parser_config.outbounds = outbounds;
        config
    }

    #[test]
    fn fragments_follow_order_contract() {
        let mut local_source = source(&["a", "b"]);
        local_source.outbounds = vec![selector("local-1")];
        let config = config(
            vec![local_source, source(&["c"])],
            vec![selector("global-1"), selector("global-2")],
        );

        let mut registry = TagRegistry::new();
        let out = generate_outbounds(&config, &mut registry, None, &TagLoader).expect("generate");

        assert_eq!(out.nodes_count, 3);
        assert_eq!(out.local_selectors_count, 1);
        assert_eq!(out.global_selectors_count, 2);
        assert_eq!(out.fragments.len(), 6);
        assert!(out.fragments[3].contains("\"tag\":\"local-1\""));
        assert!(out.fragments[3].contains("\"outbounds\":[\"a\",\"b\"]"));
        assert!(out.fragments[4].contains("\"tag\":\"global-1\""));
        assert!(out.fragments[5].contains("\"outbounds\":[\"a\",\"b\",\"c\"]"));
        assert_eq!(out.render().matches('\n').count(), 8);
    }

    #[test]
    fn failing_source_is_skipped() {
        let mut broken = source(&["zzz"]);
        broken.source = "fail".to_string();
        let config = config(vec![broken, source(&["x"])], Vec::new());
        let mut registry = TagRegistry::new();
        let out = generate_outbounds(&config, &mut registry, None, &TagLoader).expect("generate");
        assert_eq!(out.nodes_count, 1);
    }

    #[test]
    fn empty_pool_is_an_error() {
        let config = config(vec![source(&[])], vec![selector("g")]);
        let mut registry = TagRegistry::new();
        let err = generate_outbounds(&config, &mut registry, None, &TagLoader).unwrap_err();
        assert!(matches!(err, GenerateError::NoNodes));
        assert_eq!(err.to_string(), "no nodes parsed from any source");
    }

    #[test]
    fn selectors_without_members_are_dropped() {
        let mut filtered = selector("none");
        filtered.filters = Some(json!({ "tag": "missing" }));
        let config = config(vec![source(&["x"])], vec![filtered]);
        let mut registry = TagRegistry::new();
        let out = generate_outbounds(&config, &mut registry, None, &TagLoader).expect("generate");
        assert_eq!(out.global_selectors_count, 0);
        assert_eq!(out.fragments.len(), 1);
    }

    #[test]
    fn progress_checkpoints() {
        let config = config(vec![source(&["a"]), source(&["b"])], Vec::new());
        let mut registry = TagRegistry::new();
        let mut seen: Vec<f64> = Vec::new();
        let mut record = |pct: f64, _: &str| seen.push(pct);
        generate_outbounds(&config, &mut registry, Some(&mut record), &TagLoader).expect("generate");
        assert_eq!(seen, vec![10.0, 10.0, 20.0, 25.0, 45.0, 40.0, 60.0, 80.0]);
    }
}
