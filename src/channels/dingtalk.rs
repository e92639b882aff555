use crate::channels::account::{
    ensure_configured, require_field, AccountCredentials, ChannelSection, ResolvedAccount,
};
use crate::channels::adapter::{
    section_account_ids, section_configured, section_enabled, section_webhook_path,
    ChannelPlugin, OutboundContext, Platform,
};
use crate::channels::catalog::{find_channel, ChannelDescriptor, CHANNEL_CATALOG};
use crate::channels::crypto::{
    compute_signature, constant_time_eq, dingtalk_robot_sign, verify_signature, MessageCipher,
};
use crate::channels::error::{ChannelError, Result};
use crate::channels::outbound::{
    expires_in, merge_channel_data, resolve_base_url, send_json, str_field,
};
use crate::channels::target::{ensure_target, parse_target, TargetPrefix, TargetRules};
use crate::channels::token::{FetchedToken, TokenKey, FALLBACK_EXPIRES_S};
use crate::channels::types::{
    unix_timestamp, CanonicalMessage, ChannelEvent, ChatType, MediaRef, Mention,
    OutboundPayload, OutboundTarget, SendResult, TargetKind,
};
use crate::channels::webhook::{
    Inbound, PlatformWebhook, WebhookHandler, WebhookOptions, WebhookProtocol, WebhookRequest,
    WebhookResponse,
};
use crate::config::Config;
use async_trait::async_trait;
use axum::http::StatusCode;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

pub const DINGTALK_CHANNEL: &str = "dingtalk";
const DEFAULT_API_HOST: &str = "api.dingtalk.com";
const SIGN_WINDOW_MS: i64 = 60 * 60 * 1000;
const TOKEN_HEADER: &str = "x-acs-dingtalk-access-token";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DingtalkAccount {
    #[serde(default, alias = "appKey", alias = "client_id", alias = "clientId")]
    pub app_key: String,
    #[serde(
        default,
        alias = "appSecret",
        alias = "client_secret",
        alias = "clientSecret"
    )]
    pub app_secret: String,
    #[serde(default, alias = "robotCode")]
    pub robot_code: String,
    #[serde(default)]
    pub token: String,
    #[serde(default, alias = "aesKey", alias = "encoding_aes_key")]
    pub aes_key: String,
    #[serde(default, alias = "apiBase")]
    pub api_base: String,
}

impl DingtalkAccount {
    fn robot_code(&self) -> &str {
        Some(self.robot_code.trim())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.app_key.trim())
    }
}

impl AccountCredentials for DingtalkAccount {
    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![("app_key", &self.app_key), ("app_secret", &self.app_secret)]
    }
}

const TARGET_RULES: TargetRules = TargetRules {
    default_kind: TargetKind::User,
    prefixes: &[
        TargetPrefix::new("user", TargetKind::User),
        TargetPrefix::new("group", TargetKind::Group),
        TargetPrefix::new("chat", TargetKind::Group),
        TargetPrefix::new("room", TargetKind::Room),
    ],
    threaded: false,
};

pub struct DingtalkPlugin;

impl Platform for DingtalkPlugin {
    type Account = DingtalkAccount;

    const CHANNEL: &'static str = DINGTALK_CHANNEL;

    fn section(config: &Config) -> &ChannelSection<DingtalkAccount> {
        &config.channels.dingtalk
    }
}

#[async_trait]
impl WebhookProtocol for DingtalkPlugin {
    async fn process(&self, inbound: &Inbound<'_, DingtalkAccount>) -> Result<WebhookResponse> {
        let body = inbound.request.json()?;
        let subscription = body.get("encrypt").and_then(Value::as_str).is_some()
            || inbound.request.query_param("msg_signature").is_some()
            || inbound.request.query_param("signature").is_some();
        if subscription {
            return handle_subscription(inbound, &body).await;
        }
        handle_robot(inbound, &body).await
    }
}

async fn handle_robot(
    inbound: &Inbound<'_, DingtalkAccount>,
    body: &Value,
) -> Result<WebhookResponse> {
    verify_robot_sign(
        inbound.request,
        &inbound.account.config.app_secret,
        chrono::Utc::now().timestamp_millis(),
    )?;
    let message = parse_robot_message(body, inbound.account_id())?;
    let ack = match inbound.deliver_message(message).await {
        Some(reply) => json!({ "msgtype": "text", "text": { "content": reply } }),
        None => json!({ "msgtype": "empty", "empty": {} }),
    };
    Ok(WebhookResponse::json(StatusCode::OK, &ack))
}

pub fn verify_robot_sign(request: &WebhookRequest, app_secret: &str, now_ms: i64) -> Result<()> {
    let timestamp = request
        .header("timestamp")
        .ok_or_else(|| ChannelError::signature("missing timestamp header"))?;
    let sign = request
        .header("sign")
        .ok_or_else(|| ChannelError::signature("missing sign header"))?;
    let sent_ms = timestamp
        .parse::<i64>()
        .map_err(|_| ChannelError::signature("timestamp header is not numeric"))?;
    let skew = now_ms.checked_sub(sent_ms).map(i64::unsigned_abs);
    if !skew.is_some_and(|skew| skew <= SIGN_WINDOW_MS.unsigned_abs()) {
        return Err(ChannelError::signature("timestamp outside the one hour window"));
    }
    if !constant_time_eq(&dingtalk_robot_sign(app_secret.trim(), timestamp), sign) {
        return Err(ChannelError::signature("sign mismatch"));
    }
    Ok(())
}

async fn handle_subscription(
    inbound: &Inbound<'_, DingtalkAccount>,
    body: &Value,
) -> Result<WebhookResponse> {
    let account = &inbound.account.config;
    let token = require_field(DINGTALK_CHANNEL, "token", &account.token)?;
    let cipher = MessageCipher::new(require_field(DINGTALK_CHANNEL, "aes_key", &account.aes_key)?)?;
    let request = inbound.request;
    let signature = request
        .query_param("msg_signature")
        .or_else(|| request.query_param("signature"))
        .ok_or_else(|| ChannelError::signature("missing msg_signature"))?;
    let timestamp = request
        .query_param("timestamp")
        .or_else(|| request.query_param("timeStamp"))
        .ok_or_else(|| ChannelError::signature("missing timestamp"))?;
    let nonce = request
        .query_param("nonce")
        .ok_or_else(|| ChannelError::signature("missing nonce"))?;
    let encrypted = str_field(body, "encrypt")
        .ok_or_else(|| ChannelError::invalid_payload("subscription body missing encrypt"))?;
    if !verify_signature(token, timestamp, nonce, encrypted, signature) {
        return Err(ChannelError::signature("msg_signature mismatch"));
    }
    let owner = account.app_key.trim();
    let plain = cipher.decrypt(encrypted, owner)?;
    let event: Value = serde_json::from_str(&plain)
        .map_err(|_| ChannelError::invalid_payload("decrypted event is not json"))?;
    let event_type = str_field(&event, "EventType").unwrap_or("unknown").to_string();
    if event_type != "check_url" {
        inbound
            .deliver_event(ChannelEvent {
                platform: DINGTALK_CHANNEL.to_string(),
                account_id: inbound.account_id().to_string(),
                event_type,
                payload: event,
            })
            .await;
    }
    let reply = encrypted_success(&cipher, token, nonce, owner)?;
    Ok(WebhookResponse::json(StatusCode::OK, &reply))
}

fn encrypted_success(cipher: &MessageCipher, token: &str, nonce: &str, owner: &str) -> Result<Value> {
    let timestamp = chrono::Utc::now().timestamp_millis().to_string();
    let encrypt = cipher.encrypt("success", owner)?;
    let signature = compute_signature(token, &timestamp, nonce, &encrypt);
    Ok(json!({
        "msg_signature": signature,
        "timeStamp": timestamp,
        "nonce": nonce,
        "encrypt": encrypt,
    }))
}

pub fn parse_robot_message(body: &Value, account_id: &str) -> Result<CanonicalMessage> {
    let msg_type = str_field(body, "msgtype").unwrap_or("text").to_string();
    let sender_id = str_field(body, "senderStaffId")
        .or_else(|| str_field(body, "senderId"))
        .ok_or_else(|| ChannelError::invalid_payload("dingtalk payload missing sender"))?
        .to_string();
    let group = str_field(body, "conversationType") == Some("2");
    let chat_id = if group {
        str_field(body, "conversationId")
            .ok_or_else(|| ChannelError::invalid_payload("dingtalk payload missing conversationId"))?
            .to_string()
    } else {
        sender_id.clone()
    };
    let content = body.get("content").unwrap_or(&Value::Null);
    let mut media = Vec::new();
    let content_text = match msg_type.as_str() {
        "text" => body
            .get("text")
            .and_then(|text| str_field(text, "content"))
            .unwrap_or_default()
            .to_string(),
        "richText" => content
            .get("richText")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| str_field(item, "text"))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default(),
        "audio" => str_field(content, "recognition")
            .unwrap_or("[audio]")
            .to_string(),
        other => {
            if let Some(code) = str_field(content, "downloadCode") {
                media.push(MediaRef {
                    kind: other.to_string(),
                    reference: code.to_string(),
                    name: str_field(content, "fileName").map(str::to_string),
                });
            }
            format!("[{other}]")
        }
    };
    let mentions = body
        .get("atUsers")
        .and_then(Value::as_array)
        .map(|users| {
            users
                .iter()
                .filter_map(|user| {
                    str_field(user, "staffId")
                        .or_else(|| str_field(user, "dingtalkId"))
                        .map(|id| Mention {
                            id: id.to_string(),
                            name: None,
                        })
                })
                .collect()
        })
        .unwrap_or_default();
    let message_id = str_field(body, "msgId")
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    Ok(CanonicalMessage {
        platform: DINGTALK_CHANNEL.to_string(),
        account_id: account_id.to_string(),
        message_id,
        sender_id,
        sender_name: str_field(body, "senderNick").map(str::to_string),
        chat_id,
        chat_type: if group { ChatType::Group } else { ChatType::Direct },
        content_text: content_text.trim().to_string(),
        raw_content_type: msg_type,
        timestamp: unix_timestamp(body.get("createAt").and_then(Value::as_i64)),
        mentions,
        reply_to_id: None,
        media,
        raw: body.clone(),
    })
}

fn api_base(account: &DingtalkAccount) -> String {
    resolve_base_url(&account.api_base, DEFAULT_API_HOST)
}

fn token_key(account: &ResolvedAccount<DingtalkAccount>) -> TokenKey {
    let config = &account.config;
    TokenKey::new(
        DINGTALK_CHANNEL,
        &account.account_id,
        &[&api_base(config), &config.app_key, &config.app_secret],
    )
}

async fn access_token(
    context: OutboundContext<'_>,
    account: &ResolvedAccount<DingtalkAccount>,
) -> Result<String> {
    let http = context.http.clone();
    let base_url = api_base(&account.config);
    let app_key = account.config.app_key.trim().to_string();
    let app_secret = account.config.app_secret.trim().to_string();
    context
        .tokens
        .get_or_fetch(&token_key(account), move || async move {
            fetch_access_token(&http, &base_url, &app_key, &app_secret).await
        })
        .await
}

async fn fetch_access_token(
    http: &Client,
    base_url: &str,
    app_key: &str,
    app_secret: &str,
) -> Result<FetchedToken> {
    let body = send_json(
        DINGTALK_CHANNEL,
        http.post(format!("{base_url}/v1.0/oauth2/accessToken"))
            .json(&json!({ "appKey": app_key, "appSecret": app_secret })),
    )
    .await?;
    let token = str_field(&body, "accessToken")
        .ok_or_else(|| ChannelError::vendor(DINGTALK_CHANNEL, -1, "token missing accessToken"))?;
    Ok(FetchedToken::new(
        token,
        expires_in(body.get("expireIn"), FALLBACK_EXPIRES_S),
    ))
}

/// `(msgKey, msgParam)`; media rides along as a markdown image link.
fn message_template(payload: &OutboundPayload) -> (&'static str, Value) {
    let text = payload.text_body();
    let media_url = payload
        .media_url
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if media_url.is_none() && !payload.wants_markdown() {
        return ("sampleText", json!({ "content": text }));
    }
    let mut markdown = text.to_string();
    if let Some(url) = media_url {
        if !markdown.is_empty() {
            markdown.push_str("\n\n");
        }
        markdown.push_str(&format!("![image]({url})"));
    }
    let title = text
        .lines()
        .map(|line| line.trim().trim_start_matches('#').trim())
        .find(|line| !line.is_empty())
        .map(|line| line.chars().take(20).collect::<String>())
        .unwrap_or_else(|| "message".to_string());
    ("sampleMarkdown", json!({ "title": title, "text": markdown }))
}

#[async_trait]
impl ChannelPlugin for DingtalkPlugin {
    fn descriptor(&self) -> &'static ChannelDescriptor {
        find_channel(DINGTALK_CHANNEL).unwrap_or(&CHANNEL_CATALOG[1])
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
        Arc::new(PlatformWebhook::new(DingtalkPlugin, options))
    }

    async fn send_payload(
        &self,
        context: OutboundContext<'_>,
        to: &str,
        payload: &OutboundPayload,
    ) -> Result<SendResult> {
        let account = Self::resolve(context.config, context.account_id);
        ensure_configured(DINGTALK_CHANNEL, &account)?;
        let target = self.parse_target(to);
        ensure_target(&target)?;
        let media_url = payload.media_url.as_deref().map(str::trim).filter(|v| !v.is_empty());
        if payload.text_body().is_empty() && media_url.is_none() {
            return Err(ChannelError::invalid_payload("message has no text or media"));
        }
        let access_token = access_token(context, &account).await?;
        let (msg_key, msg_param) = message_template(payload);
        let robot_code = account.config.robot_code();
        let (path, mut body) = if target.kind.is_group_like() {
            (
                "/v1.0/robot/groupMessages/send",
                json!({
                    "robotCode": robot_code,
                    "openConversationId": target.id,
                    "msgKey": msg_key,
                    "msgParam": msg_param.to_string(),
                }),
            )
        } else {
            (
                "/v1.0/robot/oToMessages/batchSend",
                json!({
                    "robotCode": robot_code,
                    "userIds": [target.id],
                    "msgKey": msg_key,
                    "msgParam": msg_param.to_string(),
                }),
            )
        };
        merge_channel_data(&mut body, payload.channel_data.as_ref());
        let base_url = api_base(&account.config);
        let response = send_json(
            DINGTALK_CHANNEL,
            context
                .http
                .post(format!("{base_url}{path}"))
                .header(TOKEN_HEADER, access_token.as_str())
                .json(&body),
        )
        .await
        .inspect_err(|err| {
            if matches!(err, ChannelError::VendorApi { code: 401, .. }) {
                context.tokens.invalidate(&token_key(&account));
            }
        })?;
        let message_id = str_field(&response, "processQueryKey")
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        Ok(SendResult::new(DINGTALK_CHANNEL, &message_id, &target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue, Method, Uri};
    use bytes::Bytes;

    fn signed_request(secret: &str, timestamp: i64) -> WebhookRequest {
        let mut headers = HeaderMap::new();
        let ts = timestamp.to_string();
        headers.insert("timestamp", HeaderValue::from_str(&ts).unwrap());
        headers.insert(
            "sign",
            HeaderValue::from_str(&dingtalk_robot_sign(secret, &ts)).unwrap(),
        );
        let uri: Uri = "/channels/dingtalk/webhook".parse().unwrap();
        WebhookRequest::new(Method::POST, &uri, headers, Bytes::new())
    }

    #[test]
    fn robot_sign_checks_secret_and_window() {
        let now = 1_700_000_000_000;
        let request = signed_request("secret", now - 1000);
        assert!(verify_robot_sign(&request, "secret", now).is_ok());
        let err = verify_robot_sign(&request, "other", now).unwrap_err();
        assert_eq!(err.code(), "SIGNATURE_INVALID");
        let stale = signed_request("secret", now - SIGN_WINDOW_MS - 1);
        assert!(verify_robot_sign(&stale, "secret", now).is_err());
    }

    #[test]
    fn extreme_timestamps_fail_the_window_check() {
        let now = 1_700_000_000_000;
        for timestamp in [i64::MIN, i64::MAX, -1] {
            let err = verify_robot_sign(&signed_request("secret", timestamp), "secret", now)
                .unwrap_err();
            assert_eq!(err.code(), "SIGNATURE_INVALID");
        }
        let err = verify_robot_sign(&signed_request("secret", 0), "secret", i64::MIN).unwrap_err();
        assert_eq!(err.code(), "SIGNATURE_INVALID");
    }

    #[test]
    fn group_robot_message_parses() {
        let body = json!({
            "conversationId": "cidXXXX==",
            "atUsers": [{ "dingtalkId": "$:LWCP_v1:$bot", "staffId": "manager1" }],
            "chatbotUserId": "$:LWCP_v1:$bot",
            "msgId": "msgABC",
            "senderNick": "Zhang San",
            "isAdmin": false,
            "senderStaffId": "user001",
            "createAt": 1_700_000_000_123_i64,
            "conversationType": "2",
            "senderId": "$:LWCP_v1:$sender",
            "conversationTitle": "ops",
            "isInAtList": true,
            "text": { "content": " hello bot " },
            "msgtype": "text"
        });
        let message = parse_robot_message(&body, "default").unwrap();
        assert_eq!(message.chat_type, ChatType::Group);
        assert_eq!(message.chat_id, "cidXXXX==");
        assert_eq!(message.sender_id, "user001");
        assert_eq!(message.sender_name.as_deref(), Some("Zhang San"));
        assert_eq!(message.content_text, "hello bot");
        assert_eq!(message.mentions[0].id, "manager1");
        assert_eq!(message.timestamp.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn direct_message_uses_sender_as_chat() {
        let body = json!({
            "conversationType": "1",
            "senderStaffId": "user002",
            "msgtype": "picture",
            "content": { "downloadCode": "dl-1" }
        });
        let message = parse_robot_message(&body, "default").unwrap();
        assert_eq!(message.chat_type, ChatType::Direct);
        assert_eq!(message.chat_id, "user002");
        assert_eq!(message.content_text, "[picture]");
        assert_eq!(message.media[0].reference, "dl-1");
    }

    #[test]
    fn templates_pick_markdown_for_media() {
        let (key, param) = message_template(&OutboundPayload::text("plain hello"));
        assert_eq!(key, "sampleText");
        assert_eq!(param["content"], "plain hello");
        let (key, param) =
            message_template(&OutboundPayload::media("look", "https://a.com/cat.png"));
        assert_eq!(key, "sampleMarkdown");
        assert_eq!(param["title"], "look");
        assert_eq!(param["text"], "look\n\n![image](https://a.com/cat.png)");
    }

    #[test]
    fn subscription_reply_round_trips() {
        let key = "jWmYm7qr5nMoAUwZRjGtBxmz3KA1tkAj3ykkR6q2B2C";
        let cipher = MessageCipher::new(key).unwrap();
        let reply = encrypted_success(&cipher, "tok", "n1", "dingabc").unwrap();
        let encrypt = reply["encrypt"].as_str().unwrap();
        assert!(verify_signature(
            "tok",
            reply["timeStamp"].as_str().unwrap(),
            "n1",
            encrypt,
            reply["msg_signature"].as_str().unwrap()
        ));
        assert_eq!(cipher.decrypt(encrypt, "dingabc").unwrap(), "success");
    }
}
