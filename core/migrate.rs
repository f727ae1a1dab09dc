use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::{ParserConfig, PARSER_CONFIG_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error("cannot downgrade config from version {from} to {to}")]
    Downgrade { from: u32, to: u32 },
    #[error("unknown target version {0}")]
    UnknownTarget(u32),
    #[error("config is not a JSON object")]
    NotAnObject,
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait Migrator {
    fn migrate(&self, raw: &str, from: u32, to: u32) -> Result<ParserConfig, MigrateError>;
}

/// Version 0 means "undetectable" and is treated as the oldest layout.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyMigrator;

impl Migrator for LegacyMigrator {
    fn migrate(&self, raw: &str, from: u32, to: u32) -> Result<ParserConfig, MigrateError> {
        if from > to {
            return Err(MigrateError::Downgrade { from, to });
        }
        if to > PARSER_CONFIG_VERSION {
            return Err(MigrateError::UnknownTarget(to));
        }

        let mut root: Value = serde_json::from_str(raw)?;
        let root_map = root.as_object_mut().ok_or(MigrateError::NotAnObject)?;
        wrap_section(root_map);

        let section = root_map
            .get_mut("ParserConfig")
            .and_then(Value::as_object_mut)
            .ok_or(MigrateError::NotAnObject)?;

        if from <= 2 {
            for outbound in outbounds_mut(section) {
                lift_nested_filters(outbound);
            }
        }
        if from <= 3 {
            if let Some(Value::Array(proxies)) = section.get_mut("proxies") {
                for proxy in proxies.iter_mut().filter_map(Value::as_object_mut) {
                    rename_key(proxy, "tagPrefix", "tag_prefix");
                    rename_key(proxy, "tagPostfix", "tag_postfix");
                    rename_key(proxy, "tagMask", "tag_mask");
                }
            }
        }
        section.insert("version".to_string(), Value::from(to));

        let config: ParserConfig = serde_json::from_value(root)?;
        info!(from, to, "parser config migrated");
        Ok(config)
    }
}

fn wrap_section(root: &mut Map<String, Value>) {
    let version = root.remove("version");
    if !root.contains_key("ParserConfig") {
        let inner = std::mem::take(root);
        root.insert("ParserConfig".to_string(), Value::Object(inner));
    }
    if let (Some(version), Some(Value::Object(section))) = (version, root.get_mut("ParserConfig")) {
        section.entry("version").or_insert(version);
    }
}

fn outbounds_mut(section: &mut Map<String, Value>) -> Vec<&mut Map<String, Value>> {
    let mut out = Vec::new();
    let mut global = Vec::new();
    let mut local = Vec::new();
    for (key, value) in section.iter_mut() {
        match (key.as_str(), value) {
            ("outbounds", Value::Array(items)) => global = items.iter_mut().collect(),
            ("proxies", Value::Array(items)) => local = items.iter_mut().collect(),
            _ => {}
        }
    }
    out.extend(global.into_iter().filter_map(Value::as_object_mut));
    for proxy in local.into_iter().filter_map(Value::as_object_mut) {
        if let Some(Value::Array(items)) = proxy.get_mut("outbounds") {
            out.extend(items.iter_mut().filter_map(Value::as_object_mut));
        }
    }
    out
}

/// `outbounds: { proxies, addOutbounds, preferredDefault }` becomes the
/// top-level `filters`, `addOutbounds` and `preferredDefault` keys.
fn lift_nested_filters(outbound: &mut Map<String, Value>) {
    let nested = match outbound.get("outbounds") {
        Some(Value::Object(_)) => outbound.remove("outbounds"),
        _ => None,
    };
    let Some(Value::Object(mut nested)) = nested else {
        return;
    };

    if let Some(filters) = nested.remove("proxies") {
        outbound.entry("filters").or_insert(filters);
    }
    if let Some(add) = nested.remove("addOutbounds") {
        outbound.entry("addOutbounds").or_insert(add);
    }
    if let Some(preferred) = nested.remove("preferredDefault") {
        outbound.entry("preferredDefault").or_insert(preferred);
    }
    let tag = outbound.get("tag").and_then(Value::as_str).unwrap_or("");
    debug!(tag, "lifted nested outbound filters");
}

fn rename_key(map: &mut Map<String, Value>, from: &str, to: &str) {
    if let Some(value) = map.remove(from) {
        map.entry(to).or_insert(value);
    }
}
