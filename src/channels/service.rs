use crate::channels::account::DEFAULT_ACCOUNT_ID;
use crate::channels::adapter::{ChannelPlugin, OutboundContext};
use crate::channels::catalog::ChannelDescriptor;
use crate::channels::error::{ChannelError, Result};
use crate::channels::registry::ChannelRegistry;
use crate::channels::token::TokenCache;
use crate::channels::types::{CanonicalMessage, ChannelEvent, OutboundPayload, SendResult};
use crate::channels::webhook::{InboundSink, WebhookDispatcher, WebhookOptions};
use crate::config::Config;
use crate::config_store::ConfigStore;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    pub account_id: String,
    pub configured: bool,
}

/// One row of `GET /channels`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    #[serde(flatten)]
    pub descriptor: &'static ChannelDescriptor,
    pub enabled: bool,
    pub webhook_path: String,
    pub accounts: Vec<AccountStatus>,
}

/// Outbound entry point keyed by channel id, shared by the HTTP API and embedders.
#[derive(Clone)]
pub struct ChannelService {
    config_store: ConfigStore,
    registry: ChannelRegistry,
    tokens: TokenCache,
    http: Client,
}

impl ChannelService {
    pub fn new(
        config_store: ConfigStore,
        registry: ChannelRegistry,
        tokens: TokenCache,
        http: Client,
    ) -> Self {
        Self {
            config_store,
            registry,
            tokens,
            http,
        }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    pub async fn list_channels(&self) -> Vec<ChannelStatus> {
        let config = self.config_store.get().await;
        self.registry
            .list()
            .iter()
            .map(|plugin| channel_status(plugin.as_ref(), &config))
            .collect()
    }

    pub async fn send_payload(
        &self,
        channel: &str,
        account_id: Option<&str>,
        to: &str,
        payload: &OutboundPayload,
    ) -> Result<SendResult> {
        let plugin = self.registry.require(channel)?;
        let config = self.config_store.get().await;
        if !plugin.is_enabled(&config) {
            return Err(ChannelError::configuration(plugin.id(), "channel is disabled"));
        }
        let context = OutboundContext {
            http: &self.http,
            tokens: &self.tokens,
            config: &config,
            account_id,
        };
        match plugin.send_payload(context, to, payload).await {
            Ok(result) => {
                info!(
                    channel = plugin.id(),
                    account_id = account_id.unwrap_or(DEFAULT_ACCOUNT_ID),
                    chat_id = %result.chat_id,
                    message_id = %result.message_id,
                    "outbound message sent"
                );
                Ok(result)
            }
            Err(err) => {
                warn!(
                    channel = plugin.id(),
                    account_id = account_id.unwrap_or(DEFAULT_ACCOUNT_ID),
                    code = err.code(),
                    "outbound message failed: {err}"
                );
                Err(err)
            }
        }
    }

    pub async fn send_text(
        &self,
        channel: &str,
        account_id: Option<&str>,
        to: &str,
        text: &str,
    ) -> Result<SendResult> {
        self.send_payload(channel, account_id, to, &OutboundPayload::text(text))
            .await
    }

    pub async fn send_media(
        &self,
        channel: &str,
        account_id: Option<&str>,
        to: &str,
        text: &str,
        media_url: &str,
    ) -> Result<SendResult> {
        self.send_payload(
            channel,
            account_id,
            to,
            &OutboundPayload::media(text, media_url),
        )
        .await
    }
}

fn channel_status(plugin: &dyn ChannelPlugin, config: &Config) -> ChannelStatus {
    let accounts = plugin
        .list_account_ids(config)
        .into_iter()
        .map(|account_id| AccountStatus {
            configured: plugin.is_configured(config, Some(&account_id)),
            account_id,
        })
        .collect();
    ChannelStatus {
        descriptor: plugin.descriptor(),
        enabled: plugin.is_enabled(config),
        webhook_path: plugin.webhook_path(config),
        accounts,
    }
}

/// Mounts every enabled channel at its base path, plus `<path>/<account_id>` per named account.
pub fn build_webhook_dispatcher(
    registry: &ChannelRegistry,
    config: &Config,
    config_store: &ConfigStore,
    sink: Arc<dyn InboundSink>,
) -> WebhookDispatcher {
    let mut dispatcher = WebhookDispatcher::new();
    for plugin in registry.list() {
        if !plugin.is_enabled(config) {
            continue;
        }
        let base_path = plugin.webhook_path(config);
        let options = WebhookOptions {
            config: config_store.clone(),
            account_id: None,
            path: base_path.clone(),
            sink: sink.clone(),
        };
        dispatcher.register(plugin.webhook_handler(options));
        for account_id in plugin.list_account_ids(config) {
            if account_id == DEFAULT_ACCOUNT_ID {
                continue;
            }
            let options = WebhookOptions {
                config: config_store.clone(),
                path: format!("{base_path}/{account_id}"),
                account_id: Some(account_id),
                sink: sink.clone(),
            };
            dispatcher.register(plugin.webhook_handler(options));
        }
    }
    for (channel, path) in dispatcher.routes() {
        info!(channel, path = %path, "webhook mounted");
    }
    dispatcher
}

/// Default sink for the server binary: relays inbound traffic to `inbound.forward_url`.
///
/// The forward target may answer `{"reply": "..."}` to request a passive reply.
#[derive(Clone)]
pub struct ForwardSink {
    config_store: ConfigStore,
    http: Client,
}

impl ForwardSink {
    pub fn new(config_store: ConfigStore, http: Client) -> Self {
        Self { config_store, http }
    }

    async fn forward(&self, body: Value) -> anyhow::Result<Option<Value>> {
        let config = self.config_store.get().await;
        let Some(url) = config.inbound.forward_url() else {
            return Ok(None);
        };
        let response = self
            .http
            .post(url)
            .timeout(config.inbound.forward_timeout())
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Some(Value::Null));
        }
        Ok(Some(serde_json::from_str(&text).unwrap_or(Value::Null)))
    }
}

#[async_trait]
impl InboundSink for ForwardSink {
    async fn on_message(&self, message: CanonicalMessage) -> anyhow::Result<Option<String>> {
        let platform = message.platform.clone();
        let message_id = message.message_id.clone();
        let chat_id = message.chat_id.clone();
        match self.forward(json!({ "type": "message", "message": message })).await? {
            Some(answer) => Ok(answer
                .get("reply")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)),
            None => {
                info!(channel = %platform, chat_id = %chat_id, message_id = %message_id, "inbound message received");
                Ok(None)
            }
        }
    }

    async fn on_event(&self, event: ChannelEvent) -> anyhow::Result<()> {
        let platform = event.platform.clone();
        let event_type = event.event_type.clone();
        if self
            .forward(json!({ "type": "event", "event": event }))
            .await?
            .is_none()
        {
            info!(channel = %platform, event_type = %event_type, "inbound event received");
        }
        Ok(())
    }
}
