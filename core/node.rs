use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Vless,
    Vmess,
    Trojan,
    Shadowsocks,
    Hysteria2,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Vless => "vless",
            Scheme::Vmess => "vmess",
            Scheme::Trojan => "trojan",
            Scheme::Shadowsocks => "ss",
            Scheme::Hysteria2 => "hysteria2",
        }
    }

    pub fn outbound_type(&self) -> &'static str {
        match self {
            Scheme::Shadowsocks => "shadowsocks",
            other => other.as_str(),
        }
    }

    pub fn from_link(link: &str) -> Option<Scheme> {
        let link = link.trim_start();
        let (scheme, _) = link.split_once("://")?;
        match scheme.to_ascii_lowercase().as_str() {
            "vless" => Some(Scheme::Vless),
            "vmess" => Some(Scheme::Vmess),
            "trojan" => Some(Scheme::Trojan),
            "ss" => Some(Scheme::Shadowsocks),
            "hysteria2" | "hy2" => Some(Scheme::Hysteria2),
            _ => None,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `tag` is rewritten by the loader (template, then registry) and must not
/// change once the node has been handed to the emitters.
#[derive(Debug, Clone)]
pub struct Node {
    pub tag: String,
    pub server: String,
    pub port: u16,
    pub secret: String,
    pub flow: String,
    pub label: String,
    pub comment: String,
    pub query: Vec<(String, String)>,
    pub protocol: Protocol,
    pub tls: Option<TlsOptions>,
}

impl Node {
    pub fn scheme(&self) -> Scheme {
        self.protocol.scheme()
    }

    pub fn attribute(&self, key: &str) -> &str {
        match key {
            "tag" => &self.tag,
            "host" => &self.server,
            "label" | "fragment" => &self.label,
            "scheme" => self.scheme().as_str(),
            "comment" => &self.comment,
            _ => "",
        }
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Protocol {
    Vless,
    Vmess(VmessOptions),
    Trojan,
    Shadowsocks(ShadowsocksOptions),
    Hysteria2(Hysteria2Options),
}

impl Protocol {
    pub fn scheme(&self) -> Scheme {
        match self {
            Protocol::Vless => Scheme::Vless,
            Protocol::Vmess(_) => Scheme::Vmess,
            Protocol::Trojan => Scheme::Trojan,
            Protocol::Shadowsocks(_) => Scheme::Shadowsocks,
            Protocol::Hysteria2(_) => Scheme::Hysteria2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VmessOptions {
    pub security: Option<String>,
    pub alter_id: Option<u32>,
    pub transport: Option<Transport>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transport {
    pub kind: Option<String>,
    pub path: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl Transport {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none() && self.path.is_none() && self.headers.is_empty()
    }
}

/// Shadowsocks credentials are kept as raw bytes: subscription payloads
/// carry arbitrary byte values that must survive emission untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShadowsocksOptions {
    pub method: Vec<u8>,
    pub password: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Hysteria2Options {
    pub password: String,
    pub server_ports: Vec<String>,
    pub up_mbps: Option<u32>,
    pub down_mbps: Option<u32>,
    pub obfs: Option<Obfs>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Obfs {
    pub kind: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsOptions {
    pub enabled: bool,
    pub server_name: Option<String>,
    pub alpn: Vec<String>,
    pub utls: Option<Utls>,
    pub insecure: bool,
    pub reality: Option<Reality>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Utls {
    pub enabled: bool,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reality {
    pub enabled: bool,
    pub public_key: Option<String>,
    pub short_id: Option<String>,
}
