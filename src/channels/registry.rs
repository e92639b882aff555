use crate::channels::adapter::ChannelPlugin;
use crate::channels::catalog::normalize_channel_id;
use crate::channels::dingtalk::DingtalkPlugin;
use crate::channels::error::{ChannelError, Result};
use crate::channels::feishu::FeishuPlugin;
use crate::channels::onebot::OnebotPlugin;
use crate::channels::qqbot::QqBotPlugin;
use crate::channels::wecom::WecomPlugin;
use parking_lot::RwLock;
use std::sync::Arc;

/// Plugins in registration order; lookups accept ids and catalog aliases.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    plugins: Arc<RwLock<Vec<Arc<dyn ChannelPlugin>>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, plugin: Arc<dyn ChannelPlugin>) -> Result<()> {
        let key = plugin.id().trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(ChannelError::invalid_payload("channel plugin id is empty"));
        }
        let mut guard = self.plugins.write();
        if guard.iter().any(|item| item.id().eq_ignore_ascii_case(&key)) {
            return Err(ChannelError::invalid_payload(format!(
                "channel plugin already registered: {key}"
            )));
        }
        guard.push(plugin);
        Ok(())
    }

    pub fn register_replace(&self, plugin: Arc<dyn ChannelPlugin>) {
        let mut guard = self.plugins.write();
        match guard
            .iter()
            .position(|item| item.id().eq_ignore_ascii_case(plugin.id()))
        {
            Some(index) => guard[index] = plugin,
            None => guard.push(plugin),
        }
    }

    pub fn get(&self, channel: &str) -> Option<Arc<dyn ChannelPlugin>> {
        let trimmed = channel.trim();
        if trimmed.is_empty() {
            return None;
        }
        let key = normalize_channel_id(trimmed).unwrap_or(trimmed);
        let guard = self.plugins.read();
        guard
            .iter()
            .find(|item| item.id().eq_ignore_ascii_case(key))
            .cloned()
    }

    pub fn require(&self, channel: &str) -> Result<Arc<dyn ChannelPlugin>> {
        self.get(channel)
            .ok_or_else(|| ChannelError::UnknownChannel(channel.trim().to_string()))
    }

    pub fn list(&self) -> Vec<Arc<dyn ChannelPlugin>> {
        self.plugins.read().clone()
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.plugins.read().iter().map(|item| item.id()).collect()
    }
}

pub fn build_default_registry() -> ChannelRegistry {
    let registry = ChannelRegistry::new();
    registry.register_replace(Arc::new(WecomPlugin));
    registry.register_replace(Arc::new(DingtalkPlugin));
    registry.register_replace(Arc::new(FeishuPlugin));
    registry.register_replace(Arc::new(OnebotPlugin));
    registry.register_replace(Arc::new(QqBotPlugin));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_keeps_declared_order() {
        let registry = build_default_registry();
        assert_eq!(
            registry.ids(),
            vec!["wecom", "dingtalk", "feishu", "onebot", "qqbot"]
        );
    }

    #[test]
    fn lookup_accepts_aliases() {
        let registry = build_default_registry();
        assert_eq!(registry.get("LARK").map(|item| item.id()), Some("feishu"));
        assert_eq!(registry.get("napcat").map(|item| item.id()), Some("onebot"));
        assert!(registry.get("telegram").is_none());
        let err = registry.require("telegram").err().unwrap();
        assert_eq!(err.code(), "UNKNOWN_CHANNEL");
    }

    #[test]
    fn duplicate_register_returns_error() {
        let registry = build_default_registry();
        let err = registry.register(Arc::new(WecomPlugin)).unwrap_err();
        assert!(err.to_string().contains("already registered"));
        registry.register_replace(Arc::new(WecomPlugin));
        assert_eq!(registry.list().len(), 5);
    }
}
