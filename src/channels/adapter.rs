use crate::channels::account::{
    list_account_ids, resolve_account, AccountCredentials, ChannelSection, ResolvedAccount,
};
use crate::channels::catalog::{default_webhook_path, ChannelDescriptor};
use crate::channels::error::Result;
use crate::channels::token::TokenCache;
use crate::channels::types::{OutboundPayload, OutboundTarget, SendResult};
use crate::channels::webhook::{WebhookHandler, WebhookOptions};
use crate::config::Config;
use async_trait::async_trait;
use reqwest::Client;

/// Static binding between a platform, its account shape and its config section.
pub trait Platform: Send + Sync + 'static {
    type Account: AccountCredentials;

    const CHANNEL: &'static str;

    fn section(config: &Config) -> &ChannelSection<Self::Account>;

    fn resolve(config: &Config, account_id: Option<&str>) -> ResolvedAccount<Self::Account> {
        resolve_account(Self::section(config), account_id)
    }
}

/// Shared collaborators for one outbound call.
#[derive(Clone, Copy)]
pub struct OutboundContext<'a> {
    pub http: &'a Client,
    pub tokens: &'a TokenCache,
    pub config: &'a Config,
    pub account_id: Option<&'a str>,
}

#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    fn descriptor(&self) -> &'static ChannelDescriptor;

    fn id(&self) -> &'static str {
        self.descriptor().id
    }

    fn is_enabled(&self, config: &Config) -> bool;

    fn list_account_ids(&self, config: &Config) -> Vec<String>;

    fn is_configured(&self, config: &Config, account_id: Option<&str>) -> bool;

    fn webhook_path(&self, config: &Config) -> String;

    /// Total: never fails, unknown prefixes fall back to the platform default kind.
    fn parse_target(&self, to: &str) -> OutboundTarget;

    fn webhook_handler(&self, options: WebhookOptions) -> std::sync::Arc<dyn WebhookHandler>;

    async fn send_payload(
        &self,
        context: OutboundContext<'_>,
        to: &str,
        payload: &OutboundPayload,
    ) -> Result<SendResult>;

    async fn send_text(
        &self,
        context: OutboundContext<'_>,
        to: &str,
        text: &str,
    ) -> Result<SendResult> {
        self.send_payload(context, to, &OutboundPayload::text(text))
            .await
    }

    async fn send_media(
        &self,
        context: OutboundContext<'_>,
        to: &str,
        text: &str,
        media_url: &str,
    ) -> Result<SendResult> {
        self.send_payload(context, to, &OutboundPayload::media(text, media_url))
            .await
    }
}

/// Config-backed parts of [`ChannelPlugin`] shared by every platform.
pub fn section_enabled<P: Platform>(config: &Config) -> bool {
    P::section(config).enabled
}

pub fn section_account_ids<P: Platform>(config: &Config) -> Vec<String> {
    list_account_ids(P::section(config))
}

pub fn section_configured<P: Platform>(config: &Config, account_id: Option<&str>) -> bool {
    P::resolve(config, account_id).config.is_configured()
}

pub fn section_webhook_path<P: Platform>(config: &Config) -> String {
    P::section(config)
        .webhook_path
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| {
            let trimmed = value.trim_end_matches('/');
            if trimmed.starts_with('/') {
                trimmed.to_string()
            } else {
                format!("/{trimmed}")
            }
        })
        .unwrap_or_else(|| default_webhook_path(P::CHANNEL))
}
