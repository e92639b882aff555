use crate::channels::account::{ensure_configured, resolve_account, ResolvedAccount};
use crate::channels::adapter::Platform;
use crate::channels::error::{ChannelError, Result};
use crate::channels::types::{CanonicalMessage, ChannelEvent};
use crate::config_store::ConfigStore;
use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Transport-neutral view of one inbound HTTP request.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: Method,
    /// Request path with the query string stripped.
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl WebhookRequest {
    pub fn new(method: Method, uri: &Uri, headers: HeaderMap, body: Bytes) -> Self {
        let query = uri
            .query()
            .map(|raw| {
                let mut map = HashMap::new();
                for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
                    map.entry(key.into_owned()).or_insert_with(|| value.into_owned());
                }
                map
            })
            .unwrap_or_default();
        Self {
            method,
            path: uri.path().to_string(),
            query,
            headers,
            body,
        }
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn body_text(&self) -> Result<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|_| ChannelError::invalid_payload("request body is not utf-8"))
    }

    pub fn json(&self) -> Result<Value> {
        serde_json::from_slice(&self.body)
            .map_err(|err| ChannelError::invalid_payload(format!("request body is not json: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

impl WebhookResponse {
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }

    pub fn json(status: StatusCode, body: &Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    pub fn xml(body: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "application/xml; charset=utf-8",
            body: body.into(),
        }
    }

    pub fn no_content() -> Self {
        Self::text(StatusCode::NO_CONTENT, "")
    }

    pub fn from_error(err: &ChannelError) -> Self {
        let body = match err {
            ChannelError::Configuration { .. } => "configuration error".to_string(),
            other => other.to_string(),
        };
        Self::text(err.status(), body)
    }
}

impl IntoResponse for WebhookResponse {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.body).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(self.content_type),
        );
        response
    }
}

/// Application side of inbound delivery.
#[async_trait]
pub trait InboundSink: Send + Sync {
    /// Returned text is carried back as a passive reply where the platform supports one.
    async fn on_message(&self, message: CanonicalMessage) -> anyhow::Result<Option<String>>;

    async fn on_event(&self, _event: ChannelEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct WebhookOptions {
    pub config: ConfigStore,
    pub account_id: Option<String>,
    pub path: String,
    pub sink: Arc<dyn InboundSink>,
}

#[async_trait]
pub trait WebhookHandler: Send + Sync {
    fn channel(&self) -> &'static str;

    fn path(&self) -> &str;

    /// `None` means the request is not addressed to this handler.
    async fn handle(&self, request: &WebhookRequest) -> Option<WebhookResponse>;
}

/// Everything a platform needs to answer one verified-route request.
pub struct Inbound<'a, A> {
    pub request: &'a WebhookRequest,
    pub account: ResolvedAccount<A>,
    sink: &'a dyn InboundSink,
    channel: &'static str,
}

impl<A> Inbound<'_, A> {
    pub fn account_id(&self) -> &str {
        &self.account.account_id
    }

    /// Callback failures are logged and swallowed; the vendor still gets its ack.
    pub async fn deliver_message(&self, message: CanonicalMessage) -> Option<String> {
        debug!(
            channel = self.channel,
            account_id = %self.account.account_id,
            message_id = %message.message_id,
            "inbound message"
        );
        match self.sink.on_message(message).await {
            Ok(reply) => reply.filter(|text| !text.trim().is_empty()),
            Err(err) => {
                let err = ChannelError::Callback(err.to_string());
                error!(
                    channel = self.channel,
                    account_id = %self.account.account_id,
                    code = err.code(),
                    "{err}"
                );
                None
            }
        }
    }

    pub async fn deliver_event(&self, event: ChannelEvent) {
        if let Err(err) = self.sink.on_event(event).await {
            let err = ChannelError::Callback(err.to_string());
            error!(
                channel = self.channel,
                account_id = %self.account.account_id,
                code = err.code(),
                "{err}"
            );
        }
    }
}

/// Per-platform verification, decryption and parsing behind the shared request flow.
#[async_trait]
pub trait WebhookProtocol: Platform {
    fn accepts(&self, method: &Method) -> bool {
        method == Method::POST
    }

    async fn process(&self, inbound: &Inbound<'_, Self::Account>) -> Result<WebhookResponse>;
}

pub struct PlatformWebhook<P> {
    protocol: P,
    options: WebhookOptions,
}

impl<P: WebhookProtocol> PlatformWebhook<P> {
    pub fn new(protocol: P, options: WebhookOptions) -> Self {
        Self { protocol, options }
    }
}

#[async_trait]
impl<P: WebhookProtocol> WebhookHandler for PlatformWebhook<P> {
    fn channel(&self) -> &'static str {
        P::CHANNEL
    }

    fn path(&self) -> &str {
        &self.options.path
    }

    async fn handle(&self, request: &WebhookRequest) -> Option<WebhookResponse> {
        if !path_matches(&request.path, &self.options.path) {
            return None;
        }
        if !self.protocol.accepts(&request.method) {
            return Some(WebhookResponse::text(
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allowed",
            ));
        }
        let config = self.options.config.get().await;
        let account = resolve_account(P::section(&config), self.options.account_id.as_deref());
        if let Err(err) = ensure_configured(P::CHANNEL, &account) {
            error!(
                channel = P::CHANNEL,
                account_id = %account.account_id,
                path = %request.path,
                "{err}"
            );
            return Some(WebhookResponse::from_error(&err));
        }
        let inbound = Inbound {
            request,
            account,
            sink: self.options.sink.as_ref(),
            channel: P::CHANNEL,
        };
        match self.protocol.process(&inbound).await {
            Ok(response) => Some(response),
            Err(err) => {
                warn!(
                    channel = P::CHANNEL,
                    account_id = %inbound.account.account_id,
                    path = %request.path,
                    code = err.code(),
                    "webhook rejected: {err}"
                );
                Some(WebhookResponse::from_error(&err))
            }
        }
    }
}

pub fn path_matches(request_path: &str, registered: &str) -> bool {
    let normalize = |path: &str| {
        let trimmed = path.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        }
    };
    let request_path = request_path.split('?').next().unwrap_or(request_path);
    normalize(request_path) == normalize(registered)
}

/// Tries each registered handler in order until one claims the request.
#[derive(Clone, Default)]
pub struct WebhookDispatcher {
    handlers: Vec<Arc<dyn WebhookHandler>>,
}

impl WebhookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn WebhookHandler>) {
        self.handlers.push(handler);
    }

    pub fn routes(&self) -> Vec<(&'static str, String)> {
        self.handlers
            .iter()
            .map(|handler| (handler.channel(), handler.path().to_string()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub async fn dispatch(&self, request: &WebhookRequest) -> Option<WebhookResponse> {
        for handler in &self.handlers {
            if let Some(response) = handler.handle(request).await {
                return Some(response);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl WebhookHandler for Fixed {
        fn channel(&self) -> &'static str {
            "fixed"
        }

        fn path(&self) -> &str {
            self.0
        }

        async fn handle(&self, request: &WebhookRequest) -> Option<WebhookResponse> {
            path_matches(&request.path, self.0)
                .then(|| WebhookResponse::text(StatusCode::OK, self.0))
        }
    }

    fn request(uri: &str) -> WebhookRequest {
        let uri: Uri = uri.parse().unwrap();
        WebhookRequest::new(Method::POST, &uri, HeaderMap::new(), Bytes::new())
    }

    #[test]
    fn query_is_decoded_and_path_stripped() {
        let req = request("/channels/wecom/webhook?msg_signature=ab&echostr=a%2Bb%3D&empty=");
        assert_eq!(req.path, "/channels/wecom/webhook");
        assert_eq!(req.query_param("msg_signature"), Some("ab"));
        assert_eq!(req.query_param("echostr"), Some("a+b="));
        assert_eq!(req.query_param("empty"), None);
    }

    #[test]
    fn path_matching_ignores_trailing_slash_and_query() {
        assert!(path_matches("/a/b/", "/a/b"));
        assert!(path_matches("/a/b?x=1", "/a/b"));
        assert!(!path_matches("/a/b/c", "/a/b"));
    }

    #[tokio::test]
    async fn dispatcher_tries_handlers_in_order() {
        let mut dispatcher = WebhookDispatcher::new();
        dispatcher.register(Arc::new(Fixed("/one")));
        dispatcher.register(Arc::new(Fixed("/two")));
        let response = dispatcher.dispatch(&request("/two")).await.unwrap();
        assert_eq!(response.body, "/two");
        assert!(dispatcher.dispatch(&request("/three")).await.is_none());
        assert_eq!(dispatcher.routes()[0], ("fixed", "/one".to_string()));
    }

    #[test]
    fn configuration_errors_do_not_leak_details() {
        let response =
            WebhookResponse::from_error(&ChannelError::configuration("wecom", "secret missing"));
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.body, "configuration error");
        let response = WebhookResponse::from_error(&ChannelError::signature("bad msg_signature"));
        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert!(response.body.contains("bad msg_signature"));
    }
}
