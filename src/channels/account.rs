use crate::channels::error::{ChannelError, Result};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// One platform section of the `channels` config: a top-level default account
/// plus optional named accounts that share its field layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSection<A> {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, alias = "webhookPath")]
    pub webhook_path: Option<String>,
    #[serde(default)]
    pub accounts: BTreeMap<String, A>,
    #[serde(flatten)]
    pub base: A,
}

impl<A: Default> Default for ChannelSection<A> {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_path: None,
            accounts: BTreeMap::new(),
            base: A::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAccount<A> {
    pub account_id: String,
    pub config: A,
}

/// Credential bundle of one platform account.
pub trait AccountCredentials: Clone + Default + Send + Sync + 'static {
    /// Required fields as `(name, value)` pairs.
    fn required_fields(&self) -> Vec<(&'static str, &str)>;

    fn missing_fields(&self) -> Vec<&'static str> {
        self.required_fields()
            .into_iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| name)
            .collect()
    }

    fn is_configured(&self) -> bool {
        self.missing_fields().is_empty()
    }
}

pub fn normalize_account_id(raw: Option<&str>) -> String {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_lowercase)
        .unwrap_or_else(|| DEFAULT_ACCOUNT_ID.to_string())
}

/// Named accounts win; anything else resolves to the top-level fields as `default`.
pub fn resolve_account<A: Clone>(
    section: &ChannelSection<A>,
    account_id: Option<&str>,
) -> ResolvedAccount<A> {
    let wanted = normalize_account_id(account_id);
    let named = section
        .accounts
        .iter()
        .find(|(key, _)| normalize_account_id(Some(key)) == wanted);
    match named {
        Some((_, config)) => ResolvedAccount {
            account_id: wanted,
            config: config.clone(),
        },
        None => ResolvedAccount {
            account_id: DEFAULT_ACCOUNT_ID.to_string(),
            config: section.base.clone(),
        },
    }
}

pub fn list_account_ids<A>(section: &ChannelSection<A>) -> Vec<String> {
    let mut ids: Vec<String> = section
        .accounts
        .keys()
        .map(|key| normalize_account_id(Some(key)))
        .collect();
    if ids.is_empty() {
        return vec![DEFAULT_ACCOUNT_ID.to_string()];
    }
    ids.sort();
    ids.dedup();
    ids
}

pub fn ensure_configured<A: AccountCredentials>(
    channel: &str,
    account: &ResolvedAccount<A>,
) -> Result<()> {
    let missing = account.config.missing_fields();
    if missing.is_empty() {
        return Ok(());
    }
    Err(ChannelError::configuration(
        channel,
        format!(
            "account {} missing {}",
            account.account_id,
            missing.join(", ")
        ),
    ))
}

/// Webhook-only secrets are optional for outbound use but required by some
/// inbound flows.
pub fn require_field<'a>(channel: &str, name: &str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ChannelError::configuration(
            channel,
            format!("{name} is not configured"),
        ));
    }
    Ok(trimmed)
}

/// Accepts YAML strings, integers and floats for id-like fields such as
/// WeCom `agent_id`.
pub fn deserialize_string_from_any<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringVisitor;

    impl<'de> Visitor<'de> for StringVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("string or number")
        }

        fn visit_u64<E>(self, value: u64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.to_string())
        }

        fn visit_i64<E>(self, value: i64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.to_string())
        }

        fn visit_f64<E>(self, value: f64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value.fract() == 0.0 && value.abs() < 1e15 {
                return Ok(format!("{}", value as i64));
            }
            Ok(value.to_string())
        }

        fn visit_bool<E>(self, value: bool) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.to_string())
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.trim().to_string())
        }

        fn visit_string<E>(self, value: String) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_str(&value)
        }

        fn visit_unit<E>(self) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(String::new())
        }

        fn visit_none<E>(self) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(String::new())
        }
    }

    deserializer.deserialize_any(StringVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
    struct DemoAccount {
        #[serde(default, alias = "appId")]
        app_id: String,
        #[serde(default, alias = "appSecret")]
        app_secret: String,
        #[serde(default, alias = "agentId", deserialize_with = "deserialize_string_from_any")]
        agent_id: String,
    }

    impl AccountCredentials for DemoAccount {
        fn required_fields(&self) -> Vec<(&'static str, &str)> {
            vec![("app_id", &self.app_id), ("app_secret", &self.app_secret)]
        }
    }

    fn section() -> ChannelSection<DemoAccount> {
        serde_yaml::from_str(
            r#"
appId: base-app
app_secret: base-secret
agentId: 1000002
accounts:
  Sales:
    app_id: sales-app
    appSecret: sales-secret
  ops:
    app_id: ops-app
"#,
        )
        .unwrap()
    }

    #[test]
    fn named_account_resolves_case_insensitively() {
        let resolved = resolve_account(&section(), Some("  SALES "));
        assert_eq!(resolved.account_id, "sales");
        assert_eq!(resolved.config.app_id, "sales-app");
        assert!(resolved.config.is_configured());
    }

    #[test]
    fn missing_account_falls_back_to_default() {
        let section = section();
        let resolved = resolve_account(&section, Some("missing-id"));
        assert_eq!(resolved.account_id, "default");
        assert_eq!(resolved.config, section.base);
        assert_eq!(resolved.config.agent_id, "1000002");
        assert_eq!(resolve_account(&section, None).account_id, "default");
        assert_eq!(resolve_account(&section, Some("")).account_id, "default");
    }

    #[test]
    fn list_ids_sorted_or_default() {
        assert_eq!(list_account_ids(&section()), vec!["ops", "sales"]);
        let empty: ChannelSection<DemoAccount> = ChannelSection::default();
        assert_eq!(list_account_ids(&empty), vec!["default"]);
        assert!(!empty.enabled);
        assert!(section().enabled);
    }

    #[test]
    fn incomplete_account_reports_missing_fields() {
        let resolved = resolve_account(&section(), Some("ops"));
        assert!(!resolved.config.is_configured());
        let err = ensure_configured("demo", &resolved).unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
        assert!(err.to_string().contains("app_secret"));
        assert!(require_field("demo", "token", "  ").is_err());
    }
}
