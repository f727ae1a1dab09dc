use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use tracing::warn;

use crate::node::Node;

/// Pattern syntax, checked in order: `!/re/i`, `!literal`, `/re/i`,
/// plain literal. Regexes are always case-insensitive.
#[derive(Debug, Clone)]
pub enum Pattern {
    Literal(String),
    NotLiteral(String),
    Regex(Regex),
    NotRegex(Regex),
    Invalid,
}

impl Pattern {
    pub fn parse(raw: &str) -> Pattern {
        if let Some(rest) = raw.strip_prefix('!') {
            if let Some(expr) = regex_body(rest) {
                return match compile(expr, raw) {
                    Some(re) => Pattern::NotRegex(re),
                    None => Pattern::Invalid,
                };
            }
            return Pattern::NotLiteral(rest.to_string());
        }

        if let Some(expr) = regex_body(raw) {
            return match compile(expr, raw) {
                Some(re) => Pattern::Regex(re),
                None => Pattern::Invalid,
            };
        }

        Pattern::Literal(raw.to_string())
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Literal(literal) => value == literal,
            Pattern::NotLiteral(literal) => value != literal,
            Pattern::Regex(re) => re.is_match(value),
            Pattern::NotRegex(re) => !re.is_match(value),
            Pattern::Invalid => false,
        }
    }
}

fn regex_body(raw: &str) -> Option<&str> {
    raw.strip_prefix('/')?.strip_suffix("/i")
}

fn compile(expr: &str, raw: &str) -> Option<Regex> {
    match RegexBuilder::new(expr).case_insensitive(true).build() {
        Ok(re) => Some(re),
        Err(err) => {
            warn!(pattern = raw, error = %err, "invalid filter regex, predicate disabled");
            None
        }
    }
}

pub fn matches_pattern(value: &str, pattern: &str) -> bool {
    Pattern::parse(pattern).matches(value)
}

#[derive(Debug, Clone, Default)]
pub struct FilterGroup {
    terms: Vec<(String, Pattern)>,
}

impl FilterGroup {
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let terms = map
            .iter()
            .filter_map(|(key, value)| {
                value
                    .as_str()
                    .map(|pattern| (key.clone(), Pattern::parse(pattern)))
            })
            .collect();
        Self { terms }
    }

    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let terms = pairs
            .into_iter()
            .map(|(key, pattern)| (key.clone(), Pattern::parse(pattern)))
            .collect();
        Self { terms }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn matches(&self, node: &Node) -> bool {
        self.terms
            .iter()
            .all(|(key, pattern)| pattern.matches(node.attribute(key)))
    }
}

#[derive(Debug, Clone)]
pub enum NodeFilter {
    All,
    AnyOf(Vec<FilterGroup>),
}

impl NodeFilter {
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => NodeFilter::All,
            Some(Value::Object(map)) if map.is_empty() => NodeFilter::All,
            Some(Value::Object(map)) => NodeFilter::AnyOf(vec![FilterGroup::from_map(map)]),
            Some(Value::Array(items)) => NodeFilter::AnyOf(
                items
                    .iter()
                    .filter_map(Value::as_object)
                    .map(FilterGroup::from_map)
                    .collect(),
            ),
            Some(_) => NodeFilter::AnyOf(Vec::new()),
        }
    }

    pub fn matches(&self, node: &Node) -> bool {
        match self {
            NodeFilter::All => true,
            NodeFilter::AnyOf(groups) => groups.iter().any(|group| group.matches(node)),
        }
    }

    pub fn apply<'a>(&self, nodes: &'a [Node]) -> Vec<&'a Node> {
        nodes.iter().filter(|node| self.matches(node)).collect()
    }
}

pub fn filter_nodes<'a>(nodes: &'a [Node], filter: Option<&Value>) -> Vec<&'a Node> {
    NodeFilter::from_value(filter).apply(nodes)
}
