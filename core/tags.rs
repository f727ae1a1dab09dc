use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::node::Node;

/// Run-scoped tag bookkeeping. Create one per generation run and thread it
/// through every source; it is never shared between runs.
#[derive(Debug, Default)]
pub struct TagRegistry {
    counts: HashMap<String, usize>,
    issued: HashSet<String>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `tag` on its first occurrence and `tag-k` on the k-th.
    ///
    /// A suffixed candidate that is already taken (a node literally named
    /// `x-2`, say) moves on to the next free `k`.
    pub fn make_unique(&mut self, tag: &str) -> String {
        let count = self.counts.entry(tag.to_string()).or_insert(0);
        *count += 1;

        if *count == 1 && !self.issued.contains(tag) {
            self.issued.insert(tag.to_string());
            return tag.to_string();
        }
        if *count == 1 {
            *count = 2;
        }

        loop {
            let candidate = format!("{}-{}", tag, count);
            if self.issued.insert(candidate.clone()) {
                debug!(tag, occurrence = *count, renamed = %candidate, "duplicate tag renamed");
                return candidate;
            }
            *count += 1;
        }
    }

    pub fn occurrences(&self, tag: &str) -> usize {
        self.counts.get(tag).copied().unwrap_or(0)
    }

    pub fn duplicates(&self) -> Vec<(&str, usize)> {
        let mut out: Vec<(&str, usize)> = self
            .counts
            .iter()
            .filter(|(_, count)| **count > 1)
            .map(|(tag, count)| (tag.as_str(), *count))
            .collect();
        out.sort_unstable();
        out
    }

    pub fn log_duplicate_statistics(&self) {
        for (tag, count) in self.duplicates() {
            info!(tag, count, duplicates = count - 1, "duplicate tag statistics");
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TagTemplate<'a> {
    pub prefix: &'a str,
    pub postfix: &'a str,
    pub mask: &'a str,
}

impl TagTemplate<'_> {
    pub fn apply(&self, node: &Node, num: usize) -> String {
        if !self.mask.is_empty() {
            return expand(self.mask, node, num);
        }

        let mut tag = String::new();
        if !self.prefix.is_empty() {
            tag.push_str(&expand(self.prefix, node, num));
        }
        tag.push_str(&node.tag);
        if !self.postfix.is_empty() {
            tag.push_str(&expand(self.postfix, node, num));
        }
        tag
    }
}

/// Single pass: unknown placeholders stay verbatim and substituted text is
/// never rescanned. A stray `{$` does not hide a placeholder after it.
pub fn expand(template: &str, node: &Node, num: usize) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{$") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };

        let value = match &after[..end] {
            "tag" => Some(node.tag.clone()),
            "scheme" | "protocol" => Some(node.scheme().as_str().to_string()),
            "server" => Some(node.server.clone()),
            "port" => Some(node.port.to_string()),
            "label" => Some(node.label.clone()),
            "comment" => Some(node.comment.clone()),
            "num" => Some(num.to_string()),
            _ => None,
        };
        match value {
            Some(value) => {
                out.push_str(&value);
                rest = &after[end + 1..];
            }
            None => {
                out.push_str("{$");
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Protocol;

    fn node(tag: &str) -> Node {
        Node {
            tag: tag.to_string(),
            server: "1.2.3.4".to_string(),
            port: 8443,
            secret: "pw".to_string(),
            flow: String::new(),
            label: "Frankfurt".to_string(),
            comment: "fast".to_string(),
            query: Vec::new(),
            protocol: Protocol::Trojan,
            tls: None,
        }
    }

    #[test]
    fn make_unique_suffixes_repeats() {
        let mut registry = TagRegistry::new();
        assert_eq!(registry.make_unique("x"), "x");
        assert_eq!(registry.make_unique("x"), "x-2");
        assert_eq!(registry.make_unique("x"), "x-3");
        assert_eq!(registry.make_unique("y"), "y");
        assert_eq!(registry.occurrences("x"), 3);
        assert_eq!(registry.duplicates(), vec![("x", 3)]);
    }

    #[test]
    fn make_unique_skips_taken_suffix() {
        let mut registry = TagRegistry::new();
        assert_eq!(registry.make_unique("x-2"), "x-2");
        assert_eq!(registry.make_unique("x"), "x");
        assert_eq!(registry.make_unique("x"), "x-3");

        let mut registry = TagRegistry::new();
        assert_eq!(registry.make_unique("x"), "x");
        assert_eq!(registry.make_unique("x"), "x-2");
        assert_eq!(registry.make_unique("x-2"), "x-2-2");
    }

    #[test]
    fn mask_overrides_prefix_and_postfix() {
        let template = TagTemplate {
            prefix: "P-",
            postfix: "-S",
            mask: "{$scheme}-{$num}",
        };
        assert_eq!(template.apply(&node("orig"), 7), "trojan-7");
    }

    #[test]
    fn prefix_and_postfix_wrap_tag() {
        let template = TagTemplate {
            prefix: "[{$label}] ",
            postfix: " #{$num}",
            mask: "",
        };
        assert_eq!(template.apply(&node("orig"), 2), "[Frankfurt] orig #2");
    }

    #[test]
    fn expand_all_variables() {
        let out = expand(
            "{$tag}|{$scheme}|{$protocol}|{$server}|{$port}|{$label}|{$comment}|{$num}",
            &node("t"),
            1,
        );
        assert_eq!(out, "t|trojan|trojan|1.2.3.4|8443|Frankfurt|fast|1");
    }

    #[test]
    fn expand_is_single_pass() {
        let n = node("{$server}");
        assert_eq!(expand("<{$tag}>", &n, 1), "<{$server}>");
        assert_eq!(expand("{$unknown} {$", &n, 1), "{$unknown} {$");
    }

    #[test]
    fn expand_recovers_after_stray_marker() {
        let n = node("T");
        assert_eq!(expand("{$ {$num}", &n, 3), "{$ 3");
        assert_eq!(expand("{$x{$tag}}", &n, 1), "{$xT}");
    }
}
