use crate::channels::account::{
    deserialize_string_from_any, ensure_configured, AccountCredentials, ChannelSection,
    ResolvedAccount,
};
use crate::channels::adapter::{
    section_account_ids, section_configured, section_enabled, section_webhook_path,
    ChannelPlugin, OutboundContext, Platform,
};
use crate::channels::catalog::{find_channel, ChannelDescriptor, CHANNEL_CATALOG};
use crate::channels::crypto::{hmac_sha256_hex, qqbot_sign, qqbot_verify};
use crate::channels::error::{ChannelError, Result};
use crate::channels::outbound::{
    check_code, expires_in, id_string, merge_channel_data, resolve_base_url, send_json, str_field,
};
use crate::channels::target::{ensure_target, parse_target, TargetPrefix, TargetRules};
use crate::channels::token::{FetchedToken, TokenKey, FALLBACK_EXPIRES_S};
use crate::channels::types::{
    CanonicalMessage, ChannelEvent, ChatType, InboundItem, MediaRef, Mention, OutboundPayload,
    OutboundTarget, SendResult, TargetKind,
};
use crate::channels::webhook::{
    Inbound, PlatformWebhook, WebhookHandler, WebhookOptions, WebhookProtocol, WebhookRequest,
    WebhookResponse,
};
use crate::config::Config;
use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

pub const QQBOT_CHANNEL: &str = "qqbot";
const DEFAULT_API_HOST: &str = "api.sgroup.qq.com";
const DEFAULT_TOKEN_URL: &str = "https://bots.qq.com/app/getAppAccessToken";
const OP_DISPATCH: i64 = 0;
const OP_HTTP_ACK: i64 = 12;
const OP_VALIDATION: i64 = 13;
const TOKEN_REJECTED: [i64; 2] = [401, 11244];
const MSG_TYPE_TEXT: i64 = 0;
const MSG_TYPE_MARKDOWN: i64 = 2;
const MSG_TYPE_MEDIA: i64 = 7;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QqBotAccount {
    #[serde(default, alias = "appId", deserialize_with = "deserialize_string_from_any")]
    pub app_id: String,
    #[serde(default, alias = "clientSecret", alias = "app_secret", alias = "appSecret")]
    pub client_secret: String,
    #[serde(default, alias = "markdownSupport")]
    pub markdown_support: bool,
    /// `hmac` (default) or `ed25519` for the op 13 validation answer.
    #[serde(default, alias = "handshakeSignature")]
    pub handshake_signature: String,
    #[serde(default, alias = "apiBase")]
    pub api_base: String,
    #[serde(default, alias = "tokenUrl")]
    pub token_url: String,
}

impl AccountCredentials for QqBotAccount {
    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("app_id", &self.app_id),
            ("client_secret", &self.client_secret),
        ]
    }
}

const TARGET_RULES: TargetRules = TargetRules {
    default_kind: TargetKind::User,
    prefixes: &[
        TargetPrefix::new("c2c", TargetKind::User),
        TargetPrefix::new("user", TargetKind::User),
        TargetPrefix::new("group", TargetKind::Group),
        TargetPrefix::new("room", TargetKind::Room),
        TargetPrefix::new("channel", TargetKind::Channel),
        TargetPrefix::direct("dm", TargetKind::Channel),
    ],
    threaded: true,
};

pub struct QqBotPlugin;

impl Platform for QqBotPlugin {
    type Account = QqBotAccount;

    const CHANNEL: &'static str = QQBOT_CHANNEL;

    fn section(config: &Config) -> &ChannelSection<QqBotAccount> {
        &config.channels.qqbot
    }
}

#[async_trait]
impl WebhookProtocol for QqBotPlugin {
    async fn process(&self, inbound: &Inbound<'_, QqBotAccount>) -> Result<WebhookResponse> {
        let account = &inbound.account.config;
        let secret = account.client_secret.trim();
        let body = inbound.request.json()?;
        let op = body
            .get("op")
            .and_then(Value::as_i64)
            .ok_or_else(|| ChannelError::invalid_payload("qqbot payload missing op"))?;
        let ack = WebhookResponse::json(StatusCode::OK, &json!({ "op": OP_HTTP_ACK }));
        match op {
            OP_VALIDATION => {
                let data = body.get("d").cloned().unwrap_or(Value::Null);
                let answer = validation_answer(&data, secret, &account.handshake_signature)?;
                Ok(WebhookResponse::json(StatusCode::OK, &answer))
            }
            OP_DISPATCH => {
                verify_dispatch(inbound.request, secret)?;
                match parse_dispatch(&body, inbound.account_id())? {
                    InboundItem::Message(message) => {
                        // Replies go out through the open API with `msg_id`, not in the ack.
                        inbound.deliver_message(message).await;
                    }
                    InboundItem::Event(event) => inbound.deliver_event(event).await,
                }
                Ok(ack)
            }
            _ => Ok(ack),
        }
    }
}

/// Answer to the op 13 callback-URL validation.
pub fn validation_answer(data: &Value, secret: &str, mode: &str) -> Result<Value> {
    let plain_token = str_field(data, "plain_token")
        .ok_or_else(|| ChannelError::invalid_payload("validation missing plain_token"))?;
    let event_ts = id_string(data.get("event_ts")).unwrap_or_default();
    let message = format!("{event_ts}{plain_token}");
    let signature = if mode.trim().eq_ignore_ascii_case("ed25519") {
        qqbot_sign(secret, message.as_bytes())?
    } else {
        hmac_sha256_hex(secret, message.as_bytes())
    };
    Ok(json!({ "plain_token": plain_token, "signature": signature }))
}

pub fn verify_dispatch(request: &WebhookRequest, secret: &str) -> Result<()> {
    let signature = request
        .header("x-signature-ed25519")
        .ok_or_else(|| ChannelError::signature("missing X-Signature-Ed25519"))?;
    let timestamp = request
        .header("x-signature-timestamp")
        .ok_or_else(|| ChannelError::signature("missing X-Signature-Timestamp"))?;
    qqbot_verify(secret, timestamp, &request.body, signature)
}

pub fn parse_dispatch(body: &Value, account_id: &str) -> Result<InboundItem> {
    let event_type = str_field(body, "t").unwrap_or("unknown").to_string();
    let data = body.get("d").cloned().unwrap_or(Value::Null);
    let author = data.get("author").cloned().unwrap_or(Value::Null);
    let (chat_type, chat_id, sender_id) = match event_type.as_str() {
        "C2C_MESSAGE_CREATE" => {
            let user = str_field(&author, "user_openid").or_else(|| str_field(&author, "id"));
            (ChatType::Direct, user, user)
        }
        "GROUP_AT_MESSAGE_CREATE" => (
            ChatType::Group,
            str_field(&data, "group_openid").or_else(|| str_field(&data, "group_id")),
            str_field(&author, "member_openid").or_else(|| str_field(&author, "id")),
        ),
        "AT_MESSAGE_CREATE" => (
            ChatType::Group,
            str_field(&data, "channel_id"),
            str_field(&author, "id"),
        ),
        "DIRECT_MESSAGE_CREATE" => (
            ChatType::Direct,
            str_field(&data, "guild_id"),
            str_field(&author, "id"),
        ),
        _ => {
            return Ok(InboundItem::Event(ChannelEvent {
                platform: QQBOT_CHANNEL.to_string(),
                account_id: account_id.to_string(),
                event_type,
                payload: body.clone(),
            }));
        }
    };
    let chat_id = chat_id
        .ok_or_else(|| ChannelError::invalid_payload(format!("{event_type} missing chat id")))?
        .to_string();
    let sender_id = sender_id.unwrap_or_default().to_string();

    let mentions = data
        .get("mentions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some(Mention {
                        id: str_field(item, "id")?.to_string(),
                        name: str_field(item, "username").map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let media: Vec<MediaRef> = data
        .get("attachments")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let url = str_field(item, "url")?;
                    let url = if url.starts_with("http") {
                        url.to_string()
                    } else {
                        format!("https://{url}")
                    };
                    let kind = str_field(item, "content_type")
                        .and_then(|value| value.split('/').next())
                        .unwrap_or("file");
                    Some(MediaRef {
                        kind: kind.to_string(),
                        reference: url,
                        name: str_field(item, "filename").map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let content_text = str_field(&data, "content").unwrap_or_default().to_string();
    let raw_content_type = if content_text.is_empty() && !media.is_empty() {
        media[0].kind.clone()
    } else {
        "text".to_string()
    };
    let timestamp = str_field(&data, "timestamp")
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|value| value.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let message_id = str_field(&data, "id")
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    Ok(InboundItem::Message(CanonicalMessage {
        platform: QQBOT_CHANNEL.to_string(),
        account_id: account_id.to_string(),
        message_id,
        sender_id,
        sender_name: str_field(&author, "username").map(str::to_string),
        chat_id,
        chat_type,
        content_text,
        raw_content_type,
        timestamp,
        mentions,
        reply_to_id: data
            .get("message_reference")
            .and_then(|reference| str_field(reference, "message_id"))
            .map(str::to_string),
        media,
        raw: body.clone(),
    }))
}

fn api_base(account: &QqBotAccount) -> String {
    resolve_base_url(&account.api_base, DEFAULT_API_HOST)
}

fn token_url(account: &QqBotAccount) -> String {
    Some(account.token_url.trim())
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_TOKEN_URL)
        .to_string()
}

fn token_key(account: &ResolvedAccount<QqBotAccount>) -> TokenKey {
    let config = &account.config;
    TokenKey::new(
        QQBOT_CHANNEL,
        &account.account_id,
        &[&token_url(config), &config.app_id, &config.client_secret],
    )
}

async fn access_token(
    context: OutboundContext<'_>,
    account: &ResolvedAccount<QqBotAccount>,
) -> Result<String> {
    let http = context.http.clone();
    let url = token_url(&account.config);
    let app_id = account.config.app_id.trim().to_string();
    let client_secret = account.config.client_secret.trim().to_string();
    context
        .tokens
        .get_or_fetch(&token_key(account), move || async move {
            fetch_access_token(&http, &url, &app_id, &client_secret).await
        })
        .await
}

async fn fetch_access_token(
    http: &Client,
    url: &str,
    app_id: &str,
    client_secret: &str,
) -> Result<FetchedToken> {
    let body = send_json(
        QQBOT_CHANNEL,
        http.post(url)
            .json(&json!({ "appId": app_id, "clientSecret": client_secret })),
    )
    .await?;
    check_code(QQBOT_CHANNEL, &body, "code")?;
    let token = str_field(&body, "access_token")
        .ok_or_else(|| ChannelError::vendor(QQBOT_CHANNEL, -1, "token missing access_token"))?;
    Ok(FetchedToken::new(
        token,
        expires_in(body.get("expires_in"), FALLBACK_EXPIRES_S),
    ))
}

/// Message endpoint for a target, relative to the API base.
fn message_path(target: &OutboundTarget) -> String {
    match target.kind {
        TargetKind::Group | TargetKind::Room => format!("/v2/groups/{}/messages", target.id),
        TargetKind::Channel if target.direct => format!("/dms/{}/messages", target.id),
        TargetKind::Channel => format!("/channels/{}/messages", target.id),
        _ => format!("/v2/users/{}/messages", target.id),
    }
}

/// Rich-media upload endpoint; only the v2 user and group APIs have one.
fn files_path(target: &OutboundTarget) -> Option<String> {
    match target.kind {
        TargetKind::Group | TargetKind::Room => Some(format!("/v2/groups/{}/files", target.id)),
        TargetKind::Channel => None,
        _ => Some(format!("/v2/users/{}/files", target.id)),
    }
}

fn message_body(
    account: &QqBotAccount,
    target: &OutboundTarget,
    payload: &OutboundPayload,
    file_info: Option<&str>,
) -> Value {
    let text = payload.text_body();
    let mut body = if target.kind == TargetKind::Channel {
        let mut body = json!({ "content": text });
        if let Some(url) = payload.media_url.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
            body["image"] = Value::from(url);
        }
        body
    } else if let Some(file_info) = file_info {
        json!({
            "msg_type": MSG_TYPE_MEDIA,
            "content": if text.is_empty() { " " } else { text },
            "media": { "file_info": file_info },
        })
    } else if account.markdown_support && payload.wants_markdown() {
        json!({ "msg_type": MSG_TYPE_MARKDOWN, "markdown": { "content": text } })
    } else {
        json!({ "msg_type": MSG_TYPE_TEXT, "content": text })
    };
    if let Some(reply_to) = target.reply_to_message_id.as_deref() {
        body["msg_id"] = Value::from(reply_to);
        if target.kind != TargetKind::Channel {
            body["msg_seq"] = Value::from(rand::thread_rng().gen_range(1..=u16::MAX));
        }
    }
    body
}

async fn post_api(
    context: OutboundContext<'_>,
    account: &ResolvedAccount<QqBotAccount>,
    access_token: &str,
    path: &str,
    body: &Value,
) -> Result<Value> {
    let url = format!("{}{path}", api_base(&account.config));
    let result = send_json(
        QQBOT_CHANNEL,
        context
            .http
            .post(url)
            .header("Authorization", format!("QQBot {access_token}"))
            .json(body),
    )
    .await
    .and_then(|response| check_code(QQBOT_CHANNEL, &response, "code").map(|_| response));
    if let Err(ChannelError::VendorApi { code, .. }) = &result {
        if TOKEN_REJECTED.contains(code) {
            context.tokens.invalidate(&token_key(account));
        }
    }
    result
}

async fn upload_media(
    context: OutboundContext<'_>,
    account: &ResolvedAccount<QqBotAccount>,
    access_token: &str,
    path: &str,
    media_url: &str,
) -> Result<String> {
    let body = json!({ "file_type": 1, "url": media_url, "srv_send_msg": false });
    let response = post_api(context, account, access_token, path, &body).await?;
    str_field(&response, "file_info")
        .map(str::to_string)
        .ok_or_else(|| ChannelError::vendor(QQBOT_CHANNEL, -1, "upload missing file_info"))
}

#[async_trait]
impl ChannelPlugin for QqBotPlugin {
    fn descriptor(&self) -> &'static ChannelDescriptor {
        find_channel(QQBOT_CHANNEL).unwrap_or(&CHANNEL_CATALOG[4])
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
        parse_target(to, &TARGET_RULES)
    }

    fn webhook_handler(&self, options: WebhookOptions) -> Arc<dyn WebhookHandler> {
        Arc::new(PlatformWebhook::new(QqBotPlugin, options))
    }

    async fn send_payload(
        &self,
        context: OutboundContext<'_>,
        to: &str,
        payload: &OutboundPayload,
    ) -> Result<SendResult> {
        let account = Self::resolve(context.config, context.account_id);
        ensure_configured(QQBOT_CHANNEL, &account)?;
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
        let file_info = match (media_url, files_path(&target)) {
            (Some(media_url), Some(path)) => {
                Some(upload_media(context, &account, &access_token, &path, media_url).await?)
            }
            _ => None,
        };
        let mut body = message_body(&account.config, &target, payload, file_info.as_deref());
        merge_channel_data(&mut body, payload.channel_data.as_ref());
        let response =
            post_api(context, &account, &access_token, &message_path(&target), &body).await?;
        let message_id = id_string(response.get("id"))
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        Ok(SendResult::new(QQBOT_CHANNEL, &message_id, &target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::crypto::qqbot_signing_key;
    use ed25519_dalek::{Signature, Verifier};

    #[test]
    fn validation_answer_defaults_to_hmac() {
        let data = json!({ "plain_token": "Arq0D5A61EgUu4OxUvOp", "event_ts": "1725442341" });
        let answer = validation_answer(&data, "DG5g3B4j9X2KOErG", "").unwrap();
        assert_eq!(answer["plain_token"], "Arq0D5A61EgUu4OxUvOp");
        assert_eq!(
            answer["signature"],
            hmac_sha256_hex("DG5g3B4j9X2KOErG", b"1725442341Arq0D5A61EgUu4OxUvOp")
        );
    }

    #[test]
    fn validation_answer_can_use_ed25519() {
        let secret = "DG5g3B4j9X2KOErG";
        let data = json!({ "plain_token": "Arq0D5A61EgUu4OxUvOp", "event_ts": "1725442341" });
        let answer = validation_answer(&data, secret, "ED25519").unwrap();
        let raw = hex::decode(answer["signature"].as_str().unwrap()).unwrap();
        let signature = Signature::from_slice(&raw).unwrap();
        let key = qqbot_signing_key(secret).unwrap().verifying_key();
        assert!(key
            .verify(b"1725442341Arq0D5A61EgUu4OxUvOp", &signature)
            .is_ok());
        assert!(validation_answer(&json!({}), secret, "").is_err());
    }

    #[test]
    fn group_at_message_parses() {
        let body = json!({
            "op": 0,
            "id": "GROUP_AT_MESSAGE_CREATE:abc",
            "t": "GROUP_AT_MESSAGE_CREATE",
            "d": {
                "id": "ROBOT1.0_abc",
                "author": { "member_openid": "E4F4AEA33253A2797FB897C50B81D7ED" },
                "content": " hello",
                "group_openid": "C9F778FE6ADF9D1D1DBE395BF744A33A",
                "timestamp": "2024-09-05T10:00:00+08:00"
            }
        });
        let InboundItem::Message(message) = parse_dispatch(&body, "default").unwrap() else {
            panic!("expected message");
        };
        assert_eq!(message.chat_type, ChatType::Group);
        assert_eq!(message.chat_id, "C9F778FE6ADF9D1D1DBE395BF744A33A");
        assert_eq!(message.sender_id, "E4F4AEA33253A2797FB897C50B81D7ED");
        assert_eq!(message.content_text, "hello");
        assert_eq!(message.timestamp.timestamp(), 1725501600);
    }

    #[test]
    fn guild_direct_message_uses_guild_id() {
        let body = json!({
            "op": 0,
            "t": "DIRECT_MESSAGE_CREATE",
            "d": {
                "id": "m1",
                "guild_id": "g1",
                "channel_id": "c1",
                "author": { "id": "u1", "username": "bob" },
                "content": "hi",
                "message_reference": { "message_id": "m0" },
                "attachments": [{ "content_type": "image/png", "url": "gchat.qpic.cn/x.png", "filename": "x.png" }]
            }
        });
        let InboundItem::Message(message) = parse_dispatch(&body, "default").unwrap() else {
            panic!("expected message");
        };
        assert_eq!(message.chat_type, ChatType::Direct);
        assert_eq!(message.chat_id, "g1");
        assert_eq!(message.sender_name.as_deref(), Some("bob"));
        assert_eq!(message.reply_to_id.as_deref(), Some("m0"));
        assert_eq!(message.media[0].reference, "https://gchat.qpic.cn/x.png");
        assert_eq!(message.media[0].kind, "image");
    }

    #[test]
    fn unknown_dispatch_becomes_event() {
        let body = json!({ "op": 0, "t": "GROUP_ADD_ROBOT", "d": { "group_openid": "g" } });
        let InboundItem::Event(event) = parse_dispatch(&body, "default").unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.event_type, "GROUP_ADD_ROBOT");
    }

    #[test]
    fn targets_map_to_endpoints() {
        let plugin = QqBotPlugin;
        assert_eq!(message_path(&plugin.parse_target("c2c:OPENID")), "/v2/users/OPENID/messages");
        assert_eq!(message_path(&plugin.parse_target("group:G1")), "/v2/groups/G1/messages");
        assert_eq!(message_path(&plugin.parse_target("channel:C1")), "/channels/C1/messages");
        let dm = plugin.parse_target("dm:GUILD:MSG");
        assert_eq!(message_path(&dm), "/dms/GUILD/messages");
        assert_eq!(dm.reply_to_message_id.as_deref(), Some("MSG"));
        assert_eq!(dm.to_string(), "dm:GUILD");
        assert!(files_path(&dm).is_none());
        assert_eq!(
            files_path(&plugin.parse_target("OPENID")).as_deref(),
            Some("/v2/users/OPENID/files")
        );
    }

    #[test]
    fn body_picks_message_type() {
        let mut account = QqBotAccount::default();
        let target = QqBotPlugin.parse_target("group:G1:MSG1");
        let markdown = OutboundPayload::text("# title");
        let body = message_body(&account, &target, &markdown, None);
        assert_eq!(body["msg_type"], MSG_TYPE_TEXT);
        assert_eq!(body["msg_id"], "MSG1");
        assert!(body["msg_seq"].as_u64().is_some());
        account.markdown_support = true;
        let body = message_body(&account, &target, &markdown, None);
        assert_eq!(body["msg_type"], MSG_TYPE_MARKDOWN);
        assert_eq!(body["markdown"]["content"], "# title");
        let media = OutboundPayload::media("", "https://example.com/a.png");
        let body = message_body(&account, &target, &media, Some("FILEINFO"));
        assert_eq!(body["msg_type"], MSG_TYPE_MEDIA);
        assert_eq!(body["media"]["file_info"], "FILEINFO");
    }
}
