use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::OutboundConfig;
use crate::filter::NodeFilter;
use crate::node::{Node, Protocol, TlsOptions, Transport};

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("{field} of node {tag:?} is not valid UTF-8")]
    SecretEncoding { tag: String, field: &'static str },
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Ordered `{"key":value,...}` builder. Field order is part of the output
/// contract, so nothing here goes through a map.
#[derive(Debug, Default)]
struct JsonObject {
    parts: Vec<String>,
}

impl JsonObject {
    fn new() -> Self {
        Self::default()
    }

    fn push<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), EmitError> {
        let encoded = serde_json::to_string(value)?;
        self.push_raw(key, encoded)
    }

    fn push_raw(&mut self, key: &str, encoded: String) -> Result<(), EmitError> {
        let key = serde_json::to_string(key)?;
        self.parts.push(format!("{}:{}", key, encoded));
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    fn finish(self) -> String {
        format!("{{{}}}", self.parts.join(","))
    }
}

fn comment_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

fn secret_str<'a>(node: &Node, field: &'static str, bytes: &'a [u8]) -> Result<&'a str, EmitError> {
    std::str::from_utf8(bytes).map_err(|_| EmitError::SecretEncoding {
        tag: node.tag.clone(),
        field,
    })
}

pub fn node_json(node: &Node) -> Result<String, EmitError> {
    let mut obj = JsonObject::new();
    obj.push("tag", &node.tag)?;
    obj.push("type", node.scheme().outbound_type())?;
    obj.push("server", &node.server)?;
    obj.push("server_port", &node.port)?;

    match &node.protocol {
        Protocol::Vless => obj.push("uuid", &node.secret)?,
        Protocol::Vmess(vmess) => {
            obj.push("uuid", &node.secret)?;
            if let Some(security) = vmess.security.as_deref().filter(|s| !s.is_empty()) {
                obj.push("security", security)?;
            }
            if let Some(alter_id) = vmess.alter_id {
                obj.push("alter_id", &alter_id)?;
            }
            if let Some(transport) = vmess.transport.as_ref().filter(|t| !t.is_empty()) {
                obj.push_raw("transport", transport_json(transport)?)?;
            }
        }
        Protocol::Trojan => obj.push("password", &node.secret)?,
        Protocol::Hysteria2(hy2) => {
            if !hy2.password.is_empty() {
                obj.push("password", &hy2.password)?;
            }
            if !hy2.server_ports.is_empty() {
                obj.push("server_ports", &hy2.server_ports)?;
            }
            if let Some(up) = hy2.up_mbps.filter(|v| *v > 0) {
                obj.push("up_mbps", &up)?;
            }
            if let Some(down) = hy2.down_mbps.filter(|v| *v > 0) {
                obj.push("down_mbps", &down)?;
            }
            if let Some(obfs) = &hy2.obfs {
                let mut inner = JsonObject::new();
                if let Some(kind) = &obfs.kind {
                    inner.push("type", kind)?;
                }
                if let Some(password) = obfs.password.as_deref().filter(|p| !p.is_empty()) {
                    inner.push("password", password)?;
                }
                if !inner.is_empty() {
                    obj.push_raw("obfs", inner.finish())?;
                }
            }
        }
        Protocol::Shadowsocks(ss) => {
            if !ss.method.is_empty() {
                obj.push("method", secret_str(node, "method", &ss.method)?)?;
            }
            if !ss.password.is_empty() {
                obj.push("password", secret_str(node, "password", &ss.password)?)?;
            }
        }
    }

    if !node.flow.is_empty() {
        obj.push("flow", &node.flow)?;
    }

    if let Some(tls) = &node.tls {
        obj.push_raw("tls", tls_json(tls)?)?;
    }

    Ok(format!("\t// {}\n\t{},", comment_line(&node.label), obj.finish()))
}

fn transport_json(transport: &Transport) -> Result<String, EmitError> {
    let mut obj = JsonObject::new();
    if let Some(kind) = &transport.kind {
        obj.push("type", kind)?;
    }
    if let Some(path) = &transport.path {
        obj.push("path", path)?;
    }
    if !transport.headers.is_empty() {
        obj.push("headers", &transport.headers)?;
    }
    Ok(obj.finish())
}

fn tls_json(tls: &TlsOptions) -> Result<String, EmitError> {
    let mut obj = JsonObject::new();
    obj.push("enabled", &tls.enabled)?;
    if let Some(server_name) = &tls.server_name {
        obj.push("server_name", server_name)?;
    }
    if !tls.alpn.is_empty() {
        obj.push("alpn", &tls.alpn)?;
    }
    if let Some(utls) = &tls.utls {
        let mut inner = JsonObject::new();
        inner.push("enabled", &utls.enabled)?;
        if let Some(fingerprint) = &utls.fingerprint {
            inner.push("fingerprint", fingerprint)?;
        }
        obj.push_raw("utls", inner.finish())?;
    }
    if tls.insecure {
        obj.push("insecure", &true)?;
    }
    if let Some(reality) = &tls.reality {
        let mut inner = JsonObject::new();
        inner.push("enabled", &reality.enabled)?;
        if let Some(public_key) = &reality.public_key {
            inner.push("public_key", public_key)?;
        }
        if let Some(short_id) = &reality.short_id {
            inner.push("short_id", short_id)?;
        }
        obj.push_raw("reality", inner.finish())?;
    }
    Ok(obj.finish())
}

const INTERRUPT_KEY: &str = "interrupt_exist_connections";

pub fn selector_json(pool: &[Node], config: &OutboundConfig) -> Result<Option<String>, EmitError> {
    let filtered = NodeFilter::from_value(config.filters.as_ref()).apply(pool);
    debug!(
        selector = %config.tag,
        kind = %config.kind,
        pool = pool.len(),
        filtered = filtered.len(),
        "building selector"
    );

    let mut members: Vec<&str> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut duplicates = 0usize;
    let candidates = config
        .add_outbounds
        .iter()
        .map(String::as_str)
        .chain(filtered.iter().map(|node| node.tag.as_str()));
    for tag in candidates {
        if seen.insert(tag) {
            members.push(tag);
        } else {
            duplicates += 1;
            debug!(selector = %config.tag, tag, "skipping duplicate member");
        }
    }

    if members.is_empty() {
        debug!(selector = %config.tag, "selector has no members, skipped");
        return Ok(None);
    }
    if duplicates > 0 {
        debug!(selector = %config.tag, duplicates, "removed duplicate members");
    }

    let default = if config.has_preferred_default() {
        let preferred = NodeFilter::from_value(config.preferred_default.as_ref());
        let found = filtered.iter().find(|node| preferred.matches(node));
        if found.is_none() {
            warn!(selector = %config.tag, "preferredDefault matched no member");
        }
        found.map(|node| node.tag.as_str())
    } else {
        None
    };

    let mut obj = JsonObject::new();
    obj.push("tag", &config.tag)?;
    obj.push("type", &config.kind)?;
    if let Some(default) = default {
        obj.push("default", default)?;
    }
    obj.push("outbounds", &members)?;
    if let Some(value) = config.options.get(INTERRUPT_KEY) {
        match value {
            Value::Bool(flag) => obj.push(INTERRUPT_KEY, flag)?,
            other => obj.push(INTERRUPT_KEY, other)?,
        }
    }
    for (key, value) in config.options.iter().filter(|(k, _)| k.as_str() != INTERRUPT_KEY) {
        obj.push(key, value)?;
    }

    let mut out = String::new();
    if !config.comment.is_empty() {
        out.push_str(&format!("\t// {}\n", comment_line(&config.comment)));
    }
    out.push_str(&format!("\t{},", obj.finish()));
    Ok(Some(out))
}
