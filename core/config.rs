use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::extract::ExtractError;
use crate::migrate::MigrateError;

pub const PARSER_CONFIG_VERSION: u32 = 4;

pub const MAX_NODES_PER_SOURCE: usize = 500;

pub const DEFAULT_RELOAD: &str = "4h";

/// Neutral user agent so providers return plain link lists instead of
/// engine-specific documents.
pub const SUBSCRIPTION_USER_AGENT: &str = "SubscriptionParserClient";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid parser config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("parser config version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("invalid reload interval: {0:?}")]
    InvalidReload(String),
    #[error("invalid last_updated timestamp: {0:?}")]
    InvalidTimestamp(String),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("failed to migrate config: {0}")]
    Migrate(#[from] MigrateError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParserConfig {
    #[serde(rename = "ParserConfig")]
    pub parser_config: ParserSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParserSection {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub version: u32,
    #[serde(default)]
    pub proxies: Vec<ProxySource>,
    #[serde(default)]
    pub outbounds: Vec<OutboundConfig>,
    #[serde(default)]
    pub parser: Schedule,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reload: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_updated: String,
}

pub type SkipRule = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxySource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip: Vec<SkipRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbounds: Vec<OutboundConfig>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag_prefix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag_postfix: String,
    /// Replaces the whole tag; prefix and postfix are ignored when set.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag_mask: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundConfig {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    #[serde(rename = "addOutbounds", default, skip_serializing_if = "Vec::is_empty")]
    pub add_outbounds: Vec<String>,
    #[serde(rename = "preferredDefault", default, skip_serializing_if = "Option::is_none")]
    pub preferred_default: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(default, skip_serializing_if = "WizardHint::is_default")]
    pub wizard: WizardHint,
}

impl OutboundConfig {
    pub fn has_preferred_default(&self) -> bool {
        match &self.preferred_default {
            Some(Value::Object(map)) => !map.is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WizardHint {
    pub hidden: bool,
    /// 0 ignores the outbound, 1 checks presence only, >1 strict template match.
    pub required: u32,
}

impl WizardHint {
    pub fn is_default(&self) -> bool {
        *self == WizardHint::default()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawWizard {
    Flag(String),
    Detailed {
        #[serde(default)]
        hide: bool,
        #[serde(default)]
        required: u32,
    },
    Other(Value),
}

#[derive(Serialize)]
struct WizardOut {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    hide: bool,
    #[serde(skip_serializing_if = "is_zero")]
    required: u32,
}

impl<'de> Deserialize<'de> for WizardHint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hint = match RawWizard::deserialize(deserializer)? {
            RawWizard::Flag(flag) => WizardHint {
                hidden: flag == "hide",
                required: 0,
            },
            RawWizard::Detailed { hide, required } => WizardHint {
                hidden: hide,
                required,
            },
            RawWizard::Other(_) => WizardHint::default(),
        };
        Ok(hint)
    }
}

impl Serialize for WizardHint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WizardOut {
            hide: self.hidden,
            required: self.required,
        }
        .serialize(serializer)
    }
}

impl ParserConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn normalize(&mut self, stamp: Option<DateTime<Utc>>) {
        let section = &mut self.parser_config;
        section.version = PARSER_CONFIG_VERSION;
        if section.parser.reload.is_empty() {
            section.parser.reload = DEFAULT_RELOAD.to_string();
        }
        if let Some(now) = stamp {
            section.parser.last_updated = format_timestamp(now);
        }
    }

    pub fn proxies(&self) -> &[ProxySource] {
        &self.parser_config.proxies
    }

    pub fn outbounds(&self) -> &[OutboundConfig] {
        &self.parser_config.outbounds
    }

    pub fn schedule(&self) -> &Schedule {
        &self.parser_config.parser
    }
}

impl Schedule {
    pub fn reload_interval(&self) -> Result<Duration, ConfigError> {
        let raw = if self.reload.is_empty() {
            DEFAULT_RELOAD
        } else {
            self.reload.as_str()
        };
        humantime::parse_duration(raw).map_err(|_| ConfigError::InvalidReload(raw.to_string()))
    }

    pub fn last_updated_at(&self) -> Result<Option<DateTime<Utc>>, ConfigError> {
        if self.last_updated.is_empty() {
            return Ok(None);
        }
        DateTime::parse_from_rfc3339(&self.last_updated)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|_| ConfigError::InvalidTimestamp(self.last_updated.clone()))
    }

    pub fn next_update(&self) -> Result<Option<DateTime<Utc>>, ConfigError> {
        let interval = self.reload_interval()?;
        let Some(last) = self.last_updated_at()? else {
            return Ok(None);
        };
        let interval = chrono::Duration::from_std(interval)
            .map_err(|_| ConfigError::InvalidReload(self.reload.clone()))?;
        Ok(Some(last + interval))
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> Result<bool, ConfigError> {
        Ok(match self.next_update()? {
            Some(next) => next <= now,
            None => true,
        })
    }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    const SAMPLE: &str = r#"{
  "ParserConfig": {
    "version": 4,
    "proxies": [
      {
        "source": "https://example.com/sub",
        "skip": [{ "label": "/expired/i" }],
        "tag_prefix": "A:",
        "outbounds": [{ "tag": "a-auto", "type": "urltest" }]
      }
    ],
    "outbounds": [
      {
        "tag": "proxy-out",
        "type": "selector",
        "options": { "interrupt_exist_connections": true, "z": 1, "a": 2 },
        "filters": [{ "label": "/de/i" }],
        "addOutbounds": ["direct-out"],
        "preferredDefault": { "label": "/fast/i" },
        "comment": "main",
        "wizard": "hide"
      }
    ],
    "parser": { "reload": "2h", "last_updated": "2026-01-01T00:00:00Z" }
  }
}"#;

    #[test]
    fn parse_full_config() {
        let config = ParserConfig::from_json(SAMPLE).expect("config should parse");
        assert_eq!(config.parser_config.version, 4);
        assert_eq!(config.proxies().len(), 1);
        assert_eq!(config.proxies()[0].tag_prefix, "A:");
        assert_eq!(config.proxies()[0].outbounds[0].kind, "urltest");

        let out = &config.outbounds()[0];
        assert!(out.wizard.hidden);
        assert!(out.has_preferred_default());
        let keys: Vec<&String> = out.options.keys().collect();
        assert_eq!(keys, vec!["interrupt_exist_connections", "z", "a"]);
    }

    #[test]
    fn wizard_object_and_junk_forms() {
        let out: OutboundConfig = serde_json::from_value(json!({
            "tag": "t", "type": "selector", "wizard": { "hide": true, "required": 2 }
        }))
        .expect("outbound");
        assert_eq!(out.wizard, WizardHint { hidden: true, required: 2 });

        let out: OutboundConfig = serde_json::from_value(json!({
            "tag": "t", "type": "selector", "wizard": 17
        }))
        .expect("outbound");
        assert!(out.wizard.is_default());

        let written = serde_json::to_value(WizardHint { hidden: true, required: 0 })
            .expect("serialize");
        assert_eq!(written, json!({ "hide": true }));
    }

    #[test]
    fn normalize_sets_version_and_default_reload() {
        let mut config = ParserConfig::default();
        config.normalize(None);
        assert_eq!(config.parser_config.version, PARSER_CONFIG_VERSION);
        assert_eq!(config.schedule().reload, DEFAULT_RELOAD);
        assert!(config.schedule().last_updated.is_empty());

        let now = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        config.normalize(Some(now));
        assert_eq!(config.schedule().last_updated, "2026-03-04T05:06:07Z");
    }

    #[test]
    fn reload_interval_parsing() {
        let interval = |reload: &str| {
            Schedule {
                reload: reload.to_string(),
                ..Schedule::default()
            }
            .reload_interval()
        };
        assert_eq!(interval("4h").expect("4h"), Duration::from_secs(4 * 3600));
        assert_eq!(interval("1h30m").expect("1h30m"), Duration::from_secs(5400));
        assert_eq!(interval("1h 30m").expect("spaced"), Duration::from_secs(5400));
        assert_eq!(interval("90s").expect("90s"), Duration::from_secs(90));
        assert_eq!(interval("").expect("default"), Duration::from_secs(4 * 3600));
        for bad in ["4", "h", "3x"] {
            match interval(bad).unwrap_err() {
                ConfigError::InvalidReload(raw) => assert_eq!(raw, bad),
                other => panic!("expected InvalidReload, got {other:?}"),
            }
        }
    }

    #[test]
    fn schedule_due_check() {
        let config = ParserConfig::from_json(SAMPLE).expect("config");
        let schedule = config.schedule();
        let next = schedule.next_update().expect("next").expect("stamped");
        assert_eq!(format_timestamp(next), "2026-01-01T02:00:00Z");
        let before = Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 3, 0, 0).unwrap();
        assert!(!schedule.is_due(before).expect("due"));
        assert!(schedule.is_due(after).expect("due"));
        assert!(Schedule::default().is_due(before).expect("due"));
    }

    #[test]
    fn round_trip_keeps_customization() {
        let config = ParserConfig::from_json(SAMPLE).expect("config");
        let text = config.to_json_pretty().expect("render");
        let again = ParserConfig::from_json(&text).expect("reparse");
        assert_eq!(config, again);
    }
}
