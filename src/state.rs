// 全局状态：配置存储、渠道注册表、令牌缓存与 webhook 分发器。
use crate::channels::webhook::InboundSink;
use crate::channels::{
    build_default_registry, build_webhook_dispatcher, ChannelRegistry, ChannelService,
    ForwardSink, TokenCache, WebhookDispatcher,
};
use crate::config::Config;
use crate::config_store::ConfigStore;
use anyhow::{Context, Result};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config_store: ConfigStore,
    pub registry: ChannelRegistry,
    pub tokens: TokenCache,
    pub http: reqwest::Client,
    pub service: ChannelService,
    pub webhooks: Arc<WebhookDispatcher>,
}

impl AppState {
    /// 使用默认的转发回调构建状态。
    pub fn new(config_store: ConfigStore, config: Config) -> Result<Self> {
        let http = build_http_client(&config)?;
        let sink: Arc<dyn InboundSink> =
            Arc::new(ForwardSink::new(config_store.clone(), http.clone()));
        Ok(Self::assemble(config_store, &config, http, sink))
    }

    /// 嵌入方自带回调时使用，便于测试与宿主进程直接消费入站消息。
    pub fn with_sink(
        config_store: ConfigStore,
        config: Config,
        sink: Arc<dyn InboundSink>,
    ) -> Result<Self> {
        let http = build_http_client(&config)?;
        Ok(Self::assemble(config_store, &config, http, sink))
    }

    fn assemble(
        config_store: ConfigStore,
        config: &Config,
        http: reqwest::Client,
        sink: Arc<dyn InboundSink>,
    ) -> Self {
        let registry = build_default_registry();
        let tokens = TokenCache::new();
        // 路由在启动时确定；reload 只刷新凭据，不增减挂载路径。
        let webhooks = build_webhook_dispatcher(&registry, config, &config_store, sink);
        let service = ChannelService::new(
            config_store.clone(),
            registry.clone(),
            tokens.clone(),
            http.clone(),
        );
        Self {
            config_store,
            registry,
            tokens,
            http,
            service,
            webhooks: Arc::new(webhooks),
        }
    }
}

fn build_http_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.http.timeout())
        .build()
        .context("HTTP 客户端初始化失败")
}
