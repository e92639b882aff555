use crate::channels::account::{ensure_configured, AccountCredentials, ChannelSection, ResolvedAccount};
use crate::channels::adapter::{
    section_account_ids, section_configured, section_enabled, section_webhook_path,
    ChannelPlugin, OutboundContext, Platform,
};
use crate::channels::catalog::{find_channel, ChannelDescriptor, CHANNEL_CATALOG};
use crate::channels::crypto::{constant_time_eq, feishu_decrypt, feishu_signature};
use crate::channels::error::{ChannelError, Result};
use crate::channels::outbound::{
    check_code, download_media, expires_in, merge_channel_data, resolve_base_url, send_json,
    str_field,
};
use crate::channels::target::{ensure_target, parse_target, TargetPrefix, TargetRules};
use crate::channels::token::{FetchedToken, TokenKey, FALLBACK_EXPIRES_S};
use crate::channels::types::{
    unix_timestamp, CanonicalMessage, ChannelEvent, ChatType, InboundItem, MediaRef, Mention,
    OutboundPayload, OutboundTarget, SendResult, TargetKind,
};
use crate::channels::webhook::{
    Inbound, PlatformWebhook, WebhookHandler, WebhookOptions, WebhookProtocol, WebhookRequest,
    WebhookResponse,
};
use crate::config::Config;
use async_trait::async_trait;
use axum::http::StatusCode;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

pub const FEISHU_CHANNEL: &str = "feishu";
const DEFAULT_DOMAIN: &str = "open.feishu.cn";
const LARK_DOMAIN: &str = "open.larksuite.com";
const MESSAGE_EVENT: &str = "im.message.receive_v1";
const TOKEN_REJECTED: [i64; 2] = [99991661, 99991663];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeishuAccount {
    #[serde(default, alias = "appId")]
    pub app_id: String,
    #[serde(default, alias = "appSecret")]
    pub app_secret: String,
    #[serde(default, alias = "verificationToken")]
    pub verification_token: String,
    #[serde(default, alias = "encryptKey")]
    pub encrypt_key: String,
    /// `feishu`, `lark`, a bare host or a full base URL.
    #[serde(default)]
    pub domain: String,
}

impl AccountCredentials for FeishuAccount {
    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![("app_id", &self.app_id), ("app_secret", &self.app_secret)]
    }
}

const TARGET_RULES: TargetRules = TargetRules {
    default_kind: TargetKind::User,
    prefixes: &[
        TargetPrefix::new("user", TargetKind::User),
        TargetPrefix::new("chat", TargetKind::Group),
        TargetPrefix::new("group", TargetKind::Group),
        TargetPrefix::new("room", TargetKind::Room),
    ],
    threaded: true,
};

pub struct FeishuPlugin;

impl Platform for FeishuPlugin {
    type Account = FeishuAccount;

    const CHANNEL: &'static str = FEISHU_CHANNEL;

    fn section(config: &Config) -> &ChannelSection<FeishuAccount> {
        &config.channels.feishu
    }
}

#[async_trait]
impl WebhookProtocol for FeishuPlugin {
    async fn process(&self, inbound: &Inbound<'_, FeishuAccount>) -> Result<WebhookResponse> {
        let account = &inbound.account.config;
        let request = inbound.request;
        let body = request.json()?;
        let encrypt_key = account.encrypt_key.trim();
        let signed = request.header("x-lark-signature").is_some();
        if signed && !encrypt_key.is_empty() {
            verify_request_signature(request, encrypt_key)?;
        }
        let payload = decrypt_event_if_needed(body, encrypt_key)?;
        let challenge = str_field(&payload, "type") == Some("url_verification");
        if !signed && !challenge && !encrypt_key.is_empty() {
            return Err(ChannelError::signature("missing x-lark-signature"));
        }
        verify_token(&payload, &account.verification_token)?;
        if challenge {
            let value = str_field(&payload, "challenge")
                .ok_or_else(|| ChannelError::invalid_payload("url_verification missing challenge"))?;
            return Ok(WebhookResponse::json(
                StatusCode::OK,
                &json!({ "challenge": value }),
            ));
        }
        match parse_event(&payload, inbound.account_id())? {
            InboundItem::Message(message) => {
                // Feishu has no passive reply; callers answer through `send_payload`.
                inbound.deliver_message(message).await;
            }
            InboundItem::Event(event) => inbound.deliver_event(event).await,
        }
        Ok(WebhookResponse::json(StatusCode::OK, &json!({})))
    }
}

pub fn verify_request_signature(request: &WebhookRequest, encrypt_key: &str) -> Result<()> {
    let timestamp = request.header("x-lark-request-timestamp").unwrap_or_default();
    let nonce = request.header("x-lark-request-nonce").unwrap_or_default();
    let signature = request
        .header("x-lark-signature")
        .ok_or_else(|| ChannelError::signature("missing x-lark-signature"))?;
    let expected = feishu_signature(timestamp, nonce, encrypt_key, &request.body);
    if !constant_time_eq(&expected, &signature.to_ascii_lowercase()) {
        return Err(ChannelError::signature("x-lark-signature mismatch"));
    }
    Ok(())
}

pub fn decrypt_event_if_needed(payload: Value, encrypt_key: &str) -> Result<Value> {
    let Some(encrypted) = str_field(&payload, "encrypt") else {
        return Ok(payload);
    };
    if encrypt_key.is_empty() {
        return Err(ChannelError::configuration(
            FEISHU_CHANNEL,
            "encrypted event but encrypt_key is not configured",
        ));
    }
    let plain = feishu_decrypt(encrypt_key, encrypted)?;
    serde_json::from_str(&plain)
        .map_err(|_| ChannelError::invalid_payload("decrypted event is not json"))
}

/// Schema 2.0 carries the token in `header.token`, v1 and challenges at the top level.
fn verify_token(payload: &Value, expected: &str) -> Result<()> {
    let expected = expected.trim();
    if expected.is_empty() {
        return Ok(());
    }
    let provided = payload
        .get("header")
        .and_then(|header| str_field(header, "token"))
        .or_else(|| str_field(payload, "token"))
        .unwrap_or_default();
    if !constant_time_eq(provided, expected) {
        return Err(ChannelError::signature("verification token mismatch"));
    }
    Ok(())
}

pub fn parse_event(payload: &Value, account_id: &str) -> Result<InboundItem> {
    let event_type = payload
        .get("header")
        .and_then(|header| str_field(header, "event_type"))
        .or_else(|| payload.get("event").and_then(|event| str_field(event, "type")))
        .unwrap_or("unknown")
        .to_string();
    if event_type != MESSAGE_EVENT {
        return Ok(InboundItem::Event(ChannelEvent {
            platform: FEISHU_CHANNEL.to_string(),
            account_id: account_id.to_string(),
            event_type,
            payload: payload.clone(),
        }));
    }
    parse_message(payload, account_id).map(InboundItem::Message)
}

fn parse_message(payload: &Value, account_id: &str) -> Result<CanonicalMessage> {
    let event = payload
        .get("event")
        .ok_or_else(|| ChannelError::invalid_payload("feishu payload missing event"))?;
    let sender_id = event
        .get("sender")
        .and_then(|sender| sender.get("sender_id"))
        .and_then(|id| {
            str_field(id, "open_id")
                .or_else(|| str_field(id, "user_id"))
                .or_else(|| str_field(id, "union_id"))
        })
        .unwrap_or_default()
        .to_string();
    let message = event
        .get("message")
        .ok_or_else(|| ChannelError::invalid_payload("feishu payload missing event.message"))?;
    let chat_id = str_field(message, "chat_id")
        .ok_or_else(|| ChannelError::invalid_payload("feishu payload missing chat_id"))?
        .to_string();
    let chat_type = if str_field(message, "chat_type") == Some("group") {
        ChatType::Group
    } else {
        ChatType::Direct
    };
    let message_type = str_field(message, "message_type")
        .unwrap_or("text")
        .to_ascii_lowercase();
    let content: Value = str_field(message, "content")
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(Value::Null);

    let mentions_raw = message
        .get("mentions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mentions: Vec<Mention> = mentions_raw
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(|id| {
                str_field(id, "open_id").or_else(|| str_field(id, "user_id"))
            })?;
            Some(Mention {
                id: id.to_string(),
                name: str_field(item, "name").map(str::to_string),
            })
        })
        .collect();

    let mut media = Vec::new();
    let content_text = match message_type.as_str() {
        "text" => {
            let mut text = str_field(&content, "text").unwrap_or_default().to_string();
            for item in &mentions_raw {
                if let (Some(key), Some(name)) = (str_field(item, "key"), str_field(item, "name")) {
                    text = text.replace(key, &format!("@{name}"));
                }
            }
            text
        }
        "post" => post_text(&content),
        "image" => {
            if let Some(key) = str_field(&content, "image_key") {
                media.push(MediaRef {
                    kind: "image".to_string(),
                    reference: key.to_string(),
                    name: None,
                });
            }
            "[image]".to_string()
        }
        "file" | "audio" | "media" => {
            if let Some(key) = str_field(&content, "file_key") {
                media.push(MediaRef {
                    kind: message_type.clone(),
                    reference: key.to_string(),
                    name: str_field(&content, "file_name").map(str::to_string),
                });
            }
            format!("[{message_type}]")
        }
        other => format!("[{other}]"),
    };
    let message_id = str_field(message, "message_id")
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let created = str_field(message, "create_time").and_then(|value| value.parse::<i64>().ok());

    Ok(CanonicalMessage {
        platform: FEISHU_CHANNEL.to_string(),
        account_id: account_id.to_string(),
        message_id,
        sender_id,
        sender_name: None,
        chat_id,
        chat_type,
        content_text: content_text.trim().to_string(),
        raw_content_type: message_type,
        timestamp: unix_timestamp(created),
        mentions,
        reply_to_id: str_field(message, "parent_id").map(str::to_string),
        media,
        raw: payload.clone(),
    })
}

/// Flattens a rich-text `post` body into plain text, one paragraph per line.
fn post_text(content: &Value) -> String {
    let body = content
        .get("content")
        .or_else(|| content.get("zh_cn").and_then(|locale| locale.get("content")))
        .and_then(Value::as_array);
    let mut lines = Vec::new();
    if let Some(title) = str_field(content, "title") {
        lines.push(title.to_string());
    }
    for paragraph in body.into_iter().flatten() {
        let line: String = paragraph
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|node| {
                node.get("text")
                    .or_else(|| node.get("user_name"))
                    .and_then(Value::as_str)
            })
            .collect::<Vec<_>>()
            .join("");
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    lines.join("\n")
}

fn api_base(account: &FeishuAccount) -> String {
    let domain = account.domain.trim();
    if domain.eq_ignore_ascii_case("lark") {
        return resolve_base_url(LARK_DOMAIN, LARK_DOMAIN);
    }
    if domain.eq_ignore_ascii_case("feishu") {
        return resolve_base_url(DEFAULT_DOMAIN, DEFAULT_DOMAIN);
    }
    resolve_base_url(domain, DEFAULT_DOMAIN)
}

fn token_key(account: &ResolvedAccount<FeishuAccount>) -> TokenKey {
    let config = &account.config;
    TokenKey::new(
        FEISHU_CHANNEL,
        &account.account_id,
        &[&api_base(config), &config.app_id, &config.app_secret],
    )
}

async fn access_token(
    context: OutboundContext<'_>,
    account: &ResolvedAccount<FeishuAccount>,
) -> Result<String> {
    let http = context.http.clone();
    let base_url = api_base(&account.config);
    let app_id = account.config.app_id.trim().to_string();
    let app_secret = account.config.app_secret.trim().to_string();
    context
        .tokens
        .get_or_fetch(&token_key(account), move || async move {
            fetch_access_token(&http, &base_url, &app_id, &app_secret).await
        })
        .await
}

async fn fetch_access_token(
    http: &Client,
    base_url: &str,
    app_id: &str,
    app_secret: &str,
) -> Result<FetchedToken> {
    let body = send_json(
        FEISHU_CHANNEL,
        http.post(format!(
            "{base_url}/open-apis/auth/v3/tenant_access_token/internal"
        ))
        .json(&json!({ "app_id": app_id, "app_secret": app_secret })),
    )
    .await?;
    check_code(FEISHU_CHANNEL, &body, "code")?;
    let token = str_field(&body, "tenant_access_token").ok_or_else(|| {
        ChannelError::vendor(FEISHU_CHANNEL, -1, "token missing tenant_access_token")
    })?;
    Ok(FetchedToken::new(
        token,
        expires_in(body.get("expire"), FALLBACK_EXPIRES_S),
    ))
}

async fn upload_image(
    http: &Client,
    base_url: &str,
    access_token: &str,
    media_url: &str,
) -> Result<String> {
    let media = download_media(http, FEISHU_CHANNEL, media_url).await?;
    let part = Part::bytes(media.bytes)
        .file_name(media.file_name)
        .mime_str(&media.content_type)
        .map_err(|err| ChannelError::invalid_payload(format!("media content type: {err}")))?;
    let form = Form::new().text("image_type", "message").part("image", part);
    let body = send_json(
        FEISHU_CHANNEL,
        http.post(format!("{base_url}/open-apis/im/v1/images"))
            .bearer_auth(access_token)
            .multipart(form),
    )
    .await?;
    check_code(FEISHU_CHANNEL, &body, "code")?;
    body.get("data")
        .and_then(|data| str_field(data, "image_key"))
        .map(str::to_string)
        .ok_or_else(|| ChannelError::vendor(FEISHU_CHANNEL, -1, "upload missing image_key"))
}

/// `(msg_type, content)` for a text body.
fn text_content(payload: &OutboundPayload) -> (&'static str, Value) {
    let text = payload.text_body();
    if payload.wants_markdown() {
        let post = json!({ "zh_cn": { "content": [[{ "tag": "md", "text": text }]] } });
        return ("post", post);
    }
    ("text", json!({ "text": text }))
}

async fn post_message(
    context: OutboundContext<'_>,
    account: &ResolvedAccount<FeishuAccount>,
    access_token: &str,
    target: &OutboundTarget,
    msg_type: &str,
    content: Value,
    channel_data: Option<&Value>,
) -> Result<String> {
    let base_url = api_base(&account.config);
    let (url, mut body) = match target.reply_to_message_id.as_deref() {
        Some(reply_to) => (
            format!("{base_url}/open-apis/im/v1/messages/{reply_to}/reply"),
            json!({ "msg_type": msg_type, "content": content.to_string() }),
        ),
        None => {
            let receive_id_type = if target.kind.is_group_like() {
                "chat_id"
            } else {
                "open_id"
            };
            (
                format!("{base_url}/open-apis/im/v1/messages?receive_id_type={receive_id_type}"),
                json!({
                    "receive_id": target.id,
                    "msg_type": msg_type,
                    "content": content.to_string(),
                }),
            )
        }
    };
    merge_channel_data(&mut body, channel_data);
    let response = send_json(
        FEISHU_CHANNEL,
        context.http.post(url).bearer_auth(access_token).json(&body),
    )
    .await?;
    if let Err(err) = check_code(FEISHU_CHANNEL, &response, "code") {
        if matches!(&err, ChannelError::VendorApi { code, .. } if TOKEN_REJECTED.contains(code)) {
            context.tokens.invalidate(&token_key(account));
        }
        return Err(err);
    }
    Ok(response
        .get("data")
        .and_then(|data| str_field(data, "message_id"))
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()))
}

#[async_trait]
impl ChannelPlugin for FeishuPlugin {
    fn descriptor(&self) -> &'static ChannelDescriptor {
        find_channel(FEISHU_CHANNEL).unwrap_or(&CHANNEL_CATALOG[2])
    }

    fn is_enabled(&self, config: &Config) -> bool {
        section_enabled::<Self>(config)
    }

    fn list_account_ids(&self, config: &Config) -> Vec<String> {
        section_account_ids::<Self>(config)
    }

    fn is_configured(&self, config: &Config, account_id: Option<&str>) -> bool {
        section_configured::<Self>(config, account_id)
    }

    fn webhook_path(&self, config: &Config) -> String {
        section_webhook_path::<Self>(config)
    }

    fn parse_target(&self, to: &str) -> OutboundTarget {
        let mut target = parse_target(to, &TARGET_RULES);
        let prefixed = to.trim().to_ascii_lowercase().starts_with("user:");
        if target.kind == TargetKind::User && !prefixed && target.id.starts_with("oc_") {
            target.kind = TargetKind::Group;
        }
        target
    }

    fn webhook_handler(&self, options: WebhookOptions) -> Arc<dyn WebhookHandler> {
        Arc::new(PlatformWebhook::new(FeishuPlugin, options))
    }

    async fn send_payload(
        &self,
        context: OutboundContext<'_>,
        to: &str,
        payload: &OutboundPayload,
    ) -> Result<SendResult> {
        let account = Self::resolve(context.config, context.account_id);
        ensure_configured(FEISHU_CHANNEL, &account)?;
        let target = self.parse_target(to);
        ensure_target(&target)?;
        let media_url = payload
            .media_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if payload.text_body().is_empty() && media_url.is_none() {
            return Err(ChannelError::invalid_payload("message has no text or media"));
        }
        let access_token = access_token(context, &account).await?;
        let mut message_id = String::new();
        if !payload.text_body().is_empty() {
            let (msg_type, content) = text_content(payload);
            let extra = if media_url.is_none() {
                payload.channel_data.as_ref()
            } else {
                None
            };
            message_id = post_message(
                context,
                &account,
                &access_token,
                &target,
                msg_type,
                content,
                extra,
            )
            .await?;
        }
        if let Some(media_url) = media_url {
            let base_url = api_base(&account.config);
            let image_key = upload_image(context.http, &base_url, &access_token, media_url).await?;
            message_id = post_message(
                context,
                &account,
                &access_token,
                &target,
                "image",
                json!({ "image_key": image_key }),
                payload.channel_data.as_ref(),
            )
            .await?;
        }
        Ok(SendResult::new(FEISHU_CHANNEL, &message_id, &target))
    }
}
