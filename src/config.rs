// 配置读取与覆盖合并：基础 YAML + 可选覆盖文件 + 环境变量占位符展开。
use crate::channels::account::ChannelSection;
use crate::channels::dingtalk::DingtalkAccount;
use crate::channels::feishu::FeishuAccount;
use crate::channels::onebot::OnebotAccount;
use crate::channels::qqbot::QqBotAccount;
use crate::channels::wecom::WecomAccount;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/imgate.yaml";
pub const DEFAULT_OVERRIDE_PATH: &str = "data/config/imgate.override.yaml";
const DEFAULT_HTTP_TIMEOUT_S: u64 = 15;
const MAX_HTTP_TIMEOUT_S: u64 = 120;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub inbound: InboundConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(
        default = "default_port",
        deserialize_with = "deserialize_u16_from_any"
    )]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_level: String,
    /// `json` switches the subscriber to structured output.
    #[serde(default)]
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HttpConfig {
    #[serde(default)]
    pub timeout_s: Option<u64>,
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        let seconds = self
            .timeout_s
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_S)
            .min(MAX_HTTP_TIMEOUT_S);
        Duration::from_secs(seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InboundConfig {
    #[serde(default, alias = "forwardUrl")]
    pub forward_url: Option<String>,
    #[serde(default, alias = "forwardTimeoutS")]
    pub forward_timeout_s: Option<u64>,
}

impl InboundConfig {
    pub fn forward_url(&self) -> Option<&str> {
        self.forward_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn forward_timeout(&self) -> Duration {
        let seconds = self
            .forward_timeout_s
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_S)
            .min(MAX_HTTP_TIMEOUT_S);
        Duration::from_secs(seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub wecom: ChannelSection<WecomAccount>,
    #[serde(default)]
    pub dingtalk: ChannelSection<DingtalkAccount>,
    #[serde(default)]
    pub feishu: ChannelSection<FeishuAccount>,
    #[serde(default)]
    pub onebot: ChannelSection<OnebotAccount>,
    #[serde(default)]
    pub qqbot: ChannelSection<QqBotAccount>,
}

fn deserialize_u16_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    struct U16Visitor;

    impl<'de> Visitor<'de> for U16Visitor {
        type Value = u16;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("u16 or numeric string")
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u16::try_from(value).map_err(|_| E::custom("u16 out of range"))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value < 0 {
                return Err(E::custom("u16 must be non-negative"));
            }
            self.visit_u64(value as u64)
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Err(E::custom("u16 string is empty"));
            }
            trimmed
                .parse::<u16>()
                .map_err(|_| E::custom("invalid u16 string"))
        }

        fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_str(&value)
        }
    }

    deserializer.deserialize_any(U16Visitor)
}

pub fn config_path_default() -> PathBuf {
    PathBuf::from(env::var("IMGATE_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()))
}

pub fn override_path_default() -> PathBuf {
    PathBuf::from(
        env::var("IMGATE_CONFIG_OVERRIDE_PATH")
            .unwrap_or_else(|_| DEFAULT_OVERRIDE_PATH.to_string()),
    )
}

pub fn load_config() -> Config {
    load_config_from(&config_path_default(), Some(&override_path_default()))
}

pub fn load_config_from(base_path: &Path, override_path: Option<&Path>) -> Config {
    let mut merged = read_yaml(base_path);
    if let Some(override_path) = override_path.filter(|path| path.exists()) {
        // 只对非空字段做递归覆盖，避免误清空已有配置。
        merge_yaml(&mut merged, read_yaml(override_path));
    }

    expand_yaml_env(&mut merged);

    if merged.is_null() {
        return Config::default();
    }
    serde_yaml::from_value::<Config>(merged).unwrap_or_else(|err| {
        warn!("config parse failed, using defaults: {err}");
        Config::default()
    })
}

fn read_yaml(path: &Path) -> Value {
    // 配置文件允许不存在，避免开发环境首次启动失败。
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!("config read failed: {}, {err}", path.display());
            return Value::Null;
        }
    };
    serde_yaml::from_str(&content).unwrap_or_else(|err| {
        warn!("config yaml invalid: {}, {err}", path.display());
        Value::Null
    })
}

fn merge_yaml(base: &mut Value, override_value: Value) {
    match (base, override_value) {
        (Value::Mapping(base_map), Value::Mapping(override_map)) => {
            for (key, value) in override_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, override_value) => {
            if !override_value.is_null() {
                *base_slot = override_value;
            }
        }
    }
}

fn expand_yaml_env(value: &mut Value) {
    match value {
        Value::String(text) => {
            *text = expand_env_placeholders(text);
        }
        Value::Sequence(items) => {
            for item in items {
                expand_yaml_env(item);
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                expand_yaml_env(item);
            }
        }
        _ => {}
    }
}

/// Expands `${VAR}` and `${VAR:-default}`; unset variables without a default become empty.
fn expand_env_placeholders(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        let Some(end) = rest.find('}') else {
            output.push_str("${");
            output.push_str(rest);
            return output;
        };
        let inner = &rest[..end];
        rest = &rest[end + 1..];
        let (name, default_value) = match inner.split_once(":-") {
            Some((name, default_value)) => (name.trim(), Some(default_value)),
            None => (inner.trim(), None),
        };
        if name.is_empty() {
            output.push_str("${");
            output.push_str(inner);
            output.push('}');
            continue;
        }
        match (env::var(name).ok().filter(|value| !value.is_empty()), default_value) {
            (Some(value), _) => output.push_str(&value),
            (None, Some(default_value)) => output.push_str(default_value),
            (None, None) => {}
        }
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::account::{list_account_ids, resolve_account, AccountCredentials};

    #[test]
    fn placeholders_expand_with_defaults() {
        std::env::remove_var("IMGATE_TEST_PLACEHOLDER");
        assert_eq!(
            expand_env_placeholders("${IMGATE_TEST_PLACEHOLDER:-fallback}"),
            "fallback"
        );
        assert_eq!(
            expand_env_placeholders("a-${IMGATE_TEST_PLACEHOLDER}-b"),
            "a--b"
        );
        std::env::set_var("IMGATE_TEST_PLACEHOLDER", "value");
        assert_eq!(
            expand_env_placeholders("prefix-${IMGATE_TEST_PLACEHOLDER:-x}-suffix"),
            "prefix-value-suffix"
        );
        std::env::remove_var("IMGATE_TEST_PLACEHOLDER");
        assert_eq!(expand_env_placeholders("${unterminated"), "${unterminated");
    }

    #[test]
    fn channel_sections_accept_both_casings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imgate.yaml");
        fs::write(
            &path,
            r#"
server:
  port: "9001"
http:
  timeout_s: 500
channels:
  wecom:
    corpId: ww1
    agentId: 1000002
    secret: s
    accounts:
      Sales:
        corp_id: ww2
        agent_id: "1000003"
        secret: s2
  onebot:
    enabled: false
    httpUrl: http://127.0.0.1:5700
"#,
        )
        .unwrap();
        let config = load_config_from(&path, None);
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.http.timeout(), Duration::from_secs(120));
        let wecom = &config.channels.wecom;
        assert!(wecom.enabled);
        assert_eq!(wecom.base.agent_id, "1000002");
        assert!(wecom.base.is_configured());
        assert_eq!(list_account_ids(wecom), vec!["sales"]);
        assert_eq!(resolve_account(wecom, Some("sales")).config.corp_id, "ww2");
        assert!(!config.channels.onebot.enabled);
        assert_eq!(config.channels.onebot.base.http_url, "http://127.0.0.1:5700");
        assert!(!config.channels.feishu.enabled);
    }

    #[test]
    fn override_file_merges_over_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.yaml");
        let overlay = dir.path().join("override.yaml");
        fs::write(&base, "server:\n  host: 127.0.0.1\n  port: 8080\n").unwrap();
        fs::write(&overlay, "server:\n  port: 9090\n").unwrap();
        let config = load_config_from(&base, Some(&overlay));
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = load_config_from(Path::new("/nonexistent/imgate.yaml"), None);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.http.timeout(), Duration::from_secs(15));
    }
}
