use tracing::{debug, info, warn};

use crate::config::{ProxySource, SkipRule, MAX_NODES_PER_SOURCE};
use crate::links::decode_base64;
use crate::node::{Node, Scheme};
use crate::tags::{TagRegistry, TagTemplate};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported link: {0}")]
    Unsupported(String),
    #[error("invalid link: {0}")]
    Invalid(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("source {index} could not be loaded: {reason}")]
    Source { index: usize, reason: String },
}

pub trait ContentFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Turns one link into a node. `Ok(None)` means the node was excluded by a
/// skip rule.
pub trait LinkDecoder {
    fn decode(&self, link: &str, skip: &[SkipRule]) -> Result<Option<Node>, DecodeError>;
}

pub trait Progress {
    fn report(&mut self, percent: f64, message: &str);
}

impl<F> Progress for F
where
    F: FnMut(f64, &str),
{
    fn report(&mut self, percent: f64, message: &str) {
        self(percent, message)
    }
}

pub trait LoadNodes {
    fn load(
        &self,
        source: &ProxySource,
        registry: &mut TagRegistry,
        progress: &mut dyn Progress,
        index: usize,
        total: usize,
    ) -> Result<Vec<Node>, LoadError>;
}

pub fn is_subscription_url(input: &str) -> bool {
    let trimmed = input.trim();
    trimmed.starts_with("http://") || trimmed.starts_with("https://")
}

pub fn is_direct_link(input: &str) -> bool {
    Scheme::from_link(input.trim()).is_some()
}

#[derive(Debug, Default)]
pub struct LoadedSource {
    pub nodes: Vec<Node>,
    pub skipped_over_limit: usize,
    pub failed: usize,
}

pub struct SourceLoader<F, D> {
    fetcher: F,
    decoder: D,
    max_nodes: usize,
}

impl<F: ContentFetcher, D: LinkDecoder> SourceLoader<F, D> {
    pub fn new(fetcher: F, decoder: D) -> Self {
        Self {
            fetcher,
            decoder,
            max_nodes: MAX_NODES_PER_SOURCE,
        }
    }

    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    pub fn load_source(
        &self,
        source: &ProxySource,
        registry: &mut TagRegistry,
        progress: &mut dyn Progress,
        index: usize,
        total: usize,
    ) -> LoadedSource {
        let total = total.max(1);
        let base = 20.0 + index as f64 * 50.0 / total as f64;
        let position = format!("{}/{}", index + 1, total);
        let mut collector = Collector {
            source,
            template: TagTemplate {
                prefix: &source.tag_prefix,
                postfix: &source.tag_postfix,
                mask: &source.tag_mask,
            },
            registry,
            decoder: &self.decoder,
            max_nodes: self.max_nodes,
            out: LoadedSource::default(),
        };

        let origin = source.source.trim();
        if is_subscription_url(origin) {
            progress.report(base, &format!("Downloading subscription {}: {}", position, origin));
            match self.fetcher.fetch(origin) {
                Err(err) => {
                    warn!(source = origin, error = %err, "failed to fetch subscription");
                }
                Ok(body) if body.is_empty() => {
                    warn!(source = origin, "subscription returned empty content");
                }
                Ok(body) => {
                    debug!(source = origin, bytes = body.len(), "subscription fetched");
                    progress.report(
                        base + 10.0 / total as f64,
                        &format!("Parsing subscription {}: {}", position, origin),
                    );
                    let text = subscription_text(&body);
                    for line in split_lines(&text) {
                        collector.accept(line);
                    }
                }
            }
        } else if is_direct_link(origin) {
            progress.report(base, &format!("Parsing direct link {}", position));
            collector.accept(origin);
        } else if !origin.is_empty() {
            warn!(source = origin, "source is neither a subscription URL nor a direct link");
        }

        for (conn_index, connection) in source.connections.iter().enumerate() {
            let connection = connection.trim();
            if connection.is_empty() {
                continue;
            }
            if !is_direct_link(connection) {
                warn!(connection, "invalid direct link format in connections");
                collector.out.failed += 1;
                continue;
            }
            progress.report(
                base,
                &format!("Parsing direct link {} (connection {})", position, conn_index + 1),
            );
            collector.accept(connection);
        }

        let out = collector.out;
        if out.skipped_over_limit > 0 {
            warn!(
                source = %position,
                limit = self.max_nodes,
                skipped = out.skipped_over_limit,
                "source exceeded node limit"
            );
        }
        info!(source = %position, nodes = out.nodes.len(), failed = out.failed, "source loaded");
        out
    }
}

impl<F: ContentFetcher, D: LinkDecoder> LoadNodes for SourceLoader<F, D> {
    fn load(
        &self,
        source: &ProxySource,
        registry: &mut TagRegistry,
        progress: &mut dyn Progress,
        index: usize,
        total: usize,
    ) -> Result<Vec<Node>, LoadError> {
        Ok(self
            .load_source(source, registry, progress, index, total)
            .nodes)
    }
}

struct Collector<'a, D> {
    source: &'a ProxySource,
    template: TagTemplate<'a>,
    registry: &'a mut TagRegistry,
    decoder: &'a D,
    max_nodes: usize,
    out: LoadedSource,
}

impl<D: LinkDecoder> Collector<'_, D> {
    fn accept(&mut self, link: &str) {
        if self.out.nodes.len() >= self.max_nodes {
            if self.out.skipped_over_limit == 0 {
                debug!(limit = self.max_nodes, "node limit reached");
            }
            self.out.skipped_over_limit += 1;
            return;
        }

        let mut node = match self.decoder.decode(link, &self.source.skip) {
            Ok(Some(node)) => node,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "failed to decode link");
                self.out.failed += 1;
                return;
            }
        };

        let num = self.out.nodes.len() + 1;
        let mut tag = self.template.apply(&node, num);
        if tag.is_empty() {
            tag = node.tag.clone();
        }
        if tag.is_empty() {
            tag = format!("{}:{}", node.server, node.port);
        }
        node.tag = self.registry.make_unique(&tag);
        self.out.nodes.push(node);
    }
}

fn subscription_text(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.contains("://") {
        return text.into_owned();
    }
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    match decode_base64(&compact) {
        Ok(decoded) => {
            let decoded = String::from_utf8_lossy(&decoded).into_owned();
            if decoded.contains("://") {
                debug!("subscription body was base64 encoded");
                decoded
            } else {
                text.into_owned()
            }
        }
        Err(_) => text.into_owned(),
    }
}

fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split(['\n', '\r'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Protocol;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct MapFetcher(HashMap<String, Result<Vec<u8>, u16>>);

    impl ContentFetcher for MapFetcher {
        fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            match self.0.get(url) {
                Some(Ok(body)) => Ok(body.clone()),
                Some(Err(status)) => Err(FetchError::Status(*status)),
                None => Err(FetchError::Request(format!("no route to {url}"))),
            }
        }
    }

    /// Decodes `vless://<tag>@<server>`; `vless://bad` fails, `vless://skip` is skipped.
    struct FakeDecoder;

    impl LinkDecoder for FakeDecoder {
        fn decode(&self, link: &str, _skip: &[SkipRule]) -> Result<Option<Node>, DecodeError> {
            let body = link
                .strip_prefix("vless://")
                .ok_or_else(|| DecodeError::Unsupported(link.to_string()))?;
            if body == "bad" {
                return Err(DecodeError::Invalid("bad".to_string()));
            }
            if body == "skip" {
                return Ok(None);
            }
            let (tag, server) = body.split_once('@').unwrap_or((body, "h"));
            Ok(Some(Node {
                tag: tag.to_string(),
                server: server.to_string(),
                port: 443,
                secret: "id".to_string(),
                flow: String::new(),
                label: tag.to_string(),
                comment: String::new(),
                query: Vec::new(),
                protocol: Protocol::Vless,
                tls: None,
            }))
        }
    }

    fn loader(routes: Vec<(&str, Result<Vec<u8>, u16>)>) -> SourceLoader<MapFetcher, FakeDecoder> {
        let map = routes
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        SourceLoader::new(MapFetcher(map), FakeDecoder)
    }

    fn tags(nodes: &[Node]) -> Vec<&str> {
        nodes.iter().map(|n| n.tag.as_str()).collect()
    }

    #[test]
    fn subscription_lines_and_connections_share_numbering() {
        let body = b"vless://a@h1\r\n\r\nvless://bad\rvless://skip\nvless://b@h2\n".to_vec();
        let loader = loader(vec![("https://sub.example/x", Ok(body))]);
        let source = ProxySource {
            source: "https://sub.example/x".to_string(),
            connections: vec!["vless://c@h3".to_string(), "garbage".to_string(), "  ".to_string()],
            tag_postfix: "-{$num}".to_string(),
            ..ProxySource::default()
        };
        let mut registry = TagRegistry::new();
        let mut seen = Vec::new();
        let mut progress = |pct: f64, msg: &str| seen.push((pct, msg.to_string()));
        let out = loader.load_source(&source, &mut registry, &mut progress, 0, 1);

        assert_eq!(tags(&out.nodes), vec!["a-1", "b-2", "c-3"]);
        assert_eq!(out.failed, 2);
        assert_eq!(out.skipped_over_limit, 0);
        assert_eq!(seen[0].0, 20.0);
        assert_eq!(seen[1].0, 30.0);
        assert!(seen[0].1.starts_with("Downloading subscription 1/1"));
    }

    #[test]
    fn base64_subscription_body_is_unwrapped() {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode("vless://a@h\nvless://b@h\n");
        let loader = loader(vec![("http://sub", Ok(encoded.into_bytes()))]);
        let source = ProxySource {
            source: "http://sub".to_string(),
            ..ProxySource::default()
        };
        let mut registry = TagRegistry::new();
        let mut progress = |_: f64, _: &str| {};
        let out = loader.load_source(&source, &mut registry, &mut progress, 0, 1);
        assert_eq!(tags(&out.nodes), vec!["a", "b"]);
    }

    #[test]
    fn fetch_failure_keeps_connections() {
        let loader = loader(vec![("https://down", Err(502))]);
        let source = ProxySource {
            source: "https://down".to_string(),
            connections: vec!["vless://c@h".to_string()],
            ..ProxySource::default()
        };
        let mut registry = TagRegistry::new();
        let mut progress = |_: f64, _: &str| {};
        let out = loader.load_source(&source, &mut registry, &mut progress, 0, 1);
        assert_eq!(tags(&out.nodes), vec!["c"]);
    }

    #[test]
    fn legacy_direct_link_in_source() {
        let loader = loader(Vec::new());
        let source = ProxySource {
            source: "vless://solo@h".to_string(),
            tag_mask: "{$scheme}#{$num}".to_string(),
            tag_prefix: "ignored".to_string(),
            ..ProxySource::default()
        };
        let mut registry = TagRegistry::new();
        let mut progress = |_: f64, _: &str| {};
        let out = loader.load_source(&source, &mut registry, &mut progress, 2, 4);
        assert_eq!(tags(&out.nodes), vec!["vless#1"]);
    }

    #[test]
    fn cap_counts_across_branches() {
        let body: String = (0..4).map(|i| format!("vless://s{i}@h\n")).collect();
        let loader = loader(vec![("https://sub", Ok(body.into_bytes()))]).with_max_nodes(3);
        let source = ProxySource {
            source: "https://sub".to_string(),
            connections: vec!["vless://c1@h".to_string(), "vless://c2@h".to_string()],
            ..ProxySource::default()
        };
        let mut registry = TagRegistry::new();
        let mut progress = |_: f64, _: &str| {};
        let out = loader.load_source(&source, &mut registry, &mut progress, 0, 1);
        assert_eq!(tags(&out.nodes), vec!["s0", "s1", "s2"]);
        assert_eq!(out.skipped_over_limit, 3);
    }

    #[test]
    fn registry_is_shared_between_sources() {
        let loader = loader(Vec::new());
        let first = ProxySource {
            connections: vec!["vless://x@h".to_string()],
            ..ProxySource::default()
        };
        let second = first.clone();
        let mut registry = TagRegistry::new();
        let calls = RefCell::new(0);
        let mut progress = |_: f64, _: &str| *calls.borrow_mut() += 1;
        let a = loader.load(&first, &mut registry, &mut progress, 0, 2).expect("first");
        let b = loader.load(&second, &mut registry, &mut progress, 1, 2).expect("second");
        assert_eq!(tags(&a), vec!["x"]);
        assert_eq!(tags(&b), vec!["x-2"]);
        assert_eq!(*calls.borrow(), 2);
    }

    #[test]
    fn link_kind_detection() {
        assert!(is_subscription_url("  https://example.com/sub "));
        assert!(!is_subscription_url("vless://id@h:1"));
        assert!(is_direct_link("trojan://pw@h:443"));
        assert!(!is_direct_link("https://example.com"));
    }
}
