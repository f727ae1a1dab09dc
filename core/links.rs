use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::config::SkipRule;
use crate::filter::FilterGroup;
use crate::loader::{DecodeError, LinkDecoder};
use crate::node::{
    Hysteria2Options, Node, Obfs, Protocol, Reality, Scheme, ShadowsocksOptions, TlsOptions,
    Transport, Utls, VmessOptions,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct UriDecoder;

impl LinkDecoder for UriDecoder {
    fn decode(&self, link: &str, skip: &[SkipRule]) -> Result<Option<Node>, DecodeError> {
        let link = link.trim();
        let scheme =
            Scheme::from_link(link).ok_or_else(|| DecodeError::Unsupported(truncate(link)))?;
        let mut node = match scheme {
            Scheme::Vless => parse_vless(link)?,
            Scheme::Vmess => parse_vmess(link)?,
            Scheme::Trojan => parse_trojan(link)?,
            Scheme::Shadowsocks => parse_shadowsocks(link)?,
            Scheme::Hysteria2 => parse_hysteria2(link)?,
        };
        node.tag = if node.label.trim().is_empty() {
            format!("{}:{}", node.server, node.port)
        } else {
            node.label.clone()
        };
        validate_node(&node).map_err(DecodeError::Invalid)?;

        if let Some(index) = skip.iter().position(|rule| {
            let group = FilterGroup::from_pairs(rule);
            !group.is_empty() && group.matches(&node)
        }) {
            debug!(tag = %node.tag, rule = index, "node excluded by skip rule");
            return Ok(None);
        }
        Ok(Some(node))
    }
}

pub(crate) fn decode_base64(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let value = value.trim();
    STANDARD
        .decode(value)
        .or_else(|_| STANDARD_NO_PAD.decode(value))
        .or_else(|_| URL_SAFE.decode(value))
        .or_else(|_| URL_SAFE_NO_PAD.decode(value))
}

fn truncate(link: &str) -> String {
    link.chars().take(48).collect()
}

fn percent_decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

fn parse_url(raw: &str) -> Result<Url, DecodeError> {
    Url::parse(raw).map_err(|e| DecodeError::Invalid(format!("{}: {}", e, truncate(raw))))
}

fn host_of(url: &Url) -> Result<String, DecodeError> {
    let host = url
        .host_str()
        .ok_or_else(|| DecodeError::Invalid(format!("{} link missing host", url.scheme())))?;
    Ok(host.trim_start_matches('[').trim_end_matches(']').to_string())
}

fn label_of(url: &Url) -> String {
    url.fragment().map(percent_decode).unwrap_or_default()
}

fn query_of(url: &Url) -> Vec<(String, String)> {
    url.query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn query_get<'a>(query: &'a [(String, String)], key: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.is_empty())
}

fn is_truthy(value: Option<&str>) -> bool {
    matches!(value, Some("1") | Some("true"))
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn tls_from_query(query: &[(String, String)], default_security: &str) -> Option<TlsOptions> {
    let security = query_get(query, "security")
        .unwrap_or(default_security)
        .to_ascii_lowercase();
    if security != "tls" && security != "reality" {
        return None;
    }

    let mut utls = query_get(query, "fp").map(|fp| Utls {
        enabled: true,
        fingerprint: Some(fp.to_string()),
    });
    let reality = if security == "reality" {
        if utls.is_none() {
            utls = Some(Utls {
                enabled: true,
                fingerprint: Some("chrome".to_string()),
            });
        }
        Some(Reality {
            enabled: true,
            public_key: query_get(query, "pbk").map(str::to_string),
            short_id: query_get(query, "sid").map(str::to_string),
        })
    } else {
        None
    };

    Some(TlsOptions {
        enabled: true,
        server_name: query_get(query, "sni")
            .or_else(|| query_get(query, "peer"))
            .map(str::to_string),
        alpn: split_list(query_get(query, "alpn")),
        utls,
        insecure: is_truthy(query_get(query, "allowInsecure"))
            || is_truthy(query_get(query, "insecure")),
        reality,
    })
}

fn base_node(url: &Url, secret: String, protocol: Protocol) -> Result<Node, DecodeError> {
    let query = query_of(url);
    Ok(Node {
        tag: String::new(),
        server: host_of(url)?,
        port: url.port().unwrap_or(0),
        secret,
        flow: query_get(&query, "flow").unwrap_or_default().to_string(),
        label: label_of(url),
        comment: String::new(),
        query,
        protocol,
        tls: None,
    })
}

fn parse_vless(raw: &str) -> Result<Node, DecodeError> {
    let url = parse_url(raw)?;
    let uuid = percent_decode(url.username());
    let mut node = base_node(&url, uuid, Protocol::Vless)?;
    node.tls = tls_from_query(&node.query, "none");
    Ok(node)
}

fn parse_trojan(raw: &str) -> Result<Node, DecodeError> {
    let url = parse_url(raw)?;
    let password = percent_decode(url.username());
    let mut node = base_node(&url, password, Protocol::Trojan)?;
    node.tls = tls_from_query(&node.query, "tls");
    Ok(node)
}

fn parse_hysteria2(raw: &str) -> Result<Node, DecodeError> {
    let url = parse_url(raw)?;
    let mut password = percent_decode(url.username());
    if let Some(rest) = url.password() {
        password = format!("{}:{}", password, percent_decode(rest));
    }
    let query = &query_of(&url);

    let obfs = query_get(query, "obfs").map(|kind| Obfs {
        kind: Some(kind.to_string()),
        password: query_get(query, "obfs-password").map(str::to_string),
    });
    let options = Hysteria2Options {
        password,
        server_ports: split_list(query_get(query, "mport"))
            .into_iter()
            .map(|range| range.replace('-', ":"))
            .collect(),
        up_mbps: query_get(query, "upmbps").and_then(|v| v.parse().ok()),
        down_mbps: query_get(query, "downmbps").and_then(|v| v.parse().ok()),
        obfs,
    };
    let tls = TlsOptions {
        enabled: true,
        server_name: query_get(query, "sni").map(str::to_string),
        alpn: split_list(query_get(query, "alpn")),
        utls: None,
        insecure: is_truthy(query_get(query, "insecure")),
        reality: None,
    };
    let mut node = base_node(&url, String::new(), Protocol::Hysteria2(options))?;
    node.tls = Some(tls);
    Ok(node)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    Text(String),
}

impl NumberOrString {
    fn as_u64(&self) -> Option<u64> {
        match self {
            NumberOrString::Number(n) => Some(*n),
            NumberOrString::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VmessLink {
    #[serde(default)]
    ps: Option<String>,
    #[serde(default)]
    add: String,
    port: NumberOrString,
    #[serde(default)]
    id: String,
    #[serde(default)]
    aid: Option<NumberOrString>,
    #[serde(default)]
    scy: Option<String>,
    #[serde(default)]
    net: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    tls: Option<String>,
    #[serde(default)]
    sni: Option<String>,
    #[serde(default)]
    alpn: Option<String>,
    #[serde(default)]
    fp: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_vmess(raw: &str) -> Result<Node, DecodeError> {
    let encoded = raw
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or_default()
        .trim();
    if encoded.is_empty() {
        return Err(DecodeError::Invalid("vmess link missing payload".to_string()));
    }
    let decoded = decode_base64(encoded).map_err(|e| DecodeError::Decode(e.to_string()))?;
    let link: VmessLink =
        serde_json::from_slice(&decoded).map_err(|e| DecodeError::Decode(e.to_string()))?;

    let port = link
        .port
        .as_u64()
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| DecodeError::Invalid("invalid vmess port".to_string()))?;

    let host = non_empty(link.host);
    let kind = non_empty(link.net).filter(|net| net != "tcp");
    let mut transport = Transport {
        kind,
        path: non_empty(link.path),
        ..Transport::default()
    };
    if transport.kind.is_some() {
        if let Some(host) = &host {
            transport.headers.insert("Host".to_string(), host.clone());
        }
    } else {
        transport.path = None;
    }

    let tls = if link.tls.as_deref().map(str::to_ascii_lowercase).as_deref() == Some("tls") {
        Some(TlsOptions {
            enabled: true,
            server_name: non_empty(link.sni).or_else(|| host.clone()),
            alpn: split_list(link.alpn.as_deref()),
            utls: non_empty(link.fp).map(|fp| Utls {
                enabled: true,
                fingerprint: Some(fp),
            }),
            insecure: false,
            reality: None,
        })
    } else {
        None
    };

    let options = VmessOptions {
        security: non_empty(link.scy).or_else(|| Some("auto".to_string())),
        alter_id: link
            .aid
            .as_ref()
            .and_then(NumberOrString::as_u64)
            .and_then(|v| u32::try_from(v).ok()),
        transport: Some(transport).filter(|t| !t.is_empty()),
    };

    Ok(Node {
        tag: String::new(),
        server: link.add.trim().to_string(),
        port,
        secret: link.id.trim().to_string(),
        flow: String::new(),
        label: link.ps.unwrap_or_default(),
        comment: String::new(),
        query: Vec::new(),
        protocol: Protocol::Vmess(options),
        tls,
    })
}

fn parse_shadowsocks(raw: &str) -> Result<Node, DecodeError> {
    let rest = raw
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or_default();
    if rest.trim().is_empty() {
        return Err(DecodeError::Invalid("ss link missing payload".to_string()));
    }

    let (main, label) = match rest.split_once('#') {
        Some((before, fragment)) => (before, percent_decode(fragment)),
        None => (rest, String::new()),
    };
    let (main, query) = match main.split_once('?') {
        Some((before, query)) => (before, query),
        None => (main, ""),
    };

    let (userinfo, hostport) = match main.rsplit_once('@') {
        Some((creds, hostport)) => (
            userinfo_bytes(creds)?,
            hostport.trim_end_matches('/').to_string(),
        ),
        None => {
            let decoded = decode_base64(main).map_err(|e| DecodeError::Decode(e.to_string()))?;
            let at = decoded
                .iter()
                .rposition(|b| *b == b'@')
                .ok_or_else(|| DecodeError::Invalid("ss link missing server".to_string()))?;
            let hostport = String::from_utf8_lossy(&decoded[at + 1..]).into_owned();
            (decoded[..at].to_vec(), hostport)
        }
    };

    let colon = userinfo
        .iter()
        .position(|b| *b == b':')
        .ok_or_else(|| DecodeError::Invalid("ss credentials missing method".to_string()))?;
    let method = userinfo[..colon].to_vec();
    let password = userinfo[colon + 1..].to_vec();

    let (host, port) = hostport
        .rsplit_once(':')
        .ok_or_else(|| DecodeError::Invalid("ss link missing port".to_string()))?;
    let port = port
        .trim()
        .parse::<u16>()
        .map_err(|_| DecodeError::Invalid(format!("invalid ss port: {}", port)))?;

    let query = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(k), percent_decode(v))
        })
        .collect();

    Ok(Node {
        tag: String::new(),
        server: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        port,
        secret: String::new(),
        flow: String::new(),
        label,
        comment: String::new(),
        query,
        protocol: Protocol::Shadowsocks(ShadowsocksOptions { method, password }),
        tls: None,
    })
}

/// SIP002 userinfo is base64; some producers send it percent-encoded instead.
fn userinfo_bytes(creds: &str) -> Result<Vec<u8>, DecodeError> {
    let plain: Vec<u8> = percent_decode_str(creds).collect();
    if plain.contains(&b':') {
        return Ok(plain);
    }
    decode_base64(&String::from_utf8_lossy(&plain)).map_err(|e| DecodeError::Decode(e.to_string()))
}

fn validate_node(node: &Node) -> Result<(), String> {
    if node.server.trim().is_empty() {
        return Err(format!("{}: server is empty", node.scheme()));
    }
    if node.port == 0 {
        return Err(format!("{}: port must be > 0", node.scheme()));
    }
    match &node.protocol {
        Protocol::Vless | Protocol::Vmess(_) if node.secret.trim().is_empty() => {
            Err(format!("{}: uuid is required", node.scheme()))
        }
        Protocol::Trojan if node.secret.is_empty() => {
            Err("trojan: password is required".to_string())
        }
        Protocol::Shadowsocks(ss) if ss.password.is_empty() || ss.method.is_empty() => {
            Err("ss: method and password are required".to_string())
        }
        _ => Ok(()),
    }
}
