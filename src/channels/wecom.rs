use crate::channels::account::{
    deserialize_string_from_any, ensure_configured, require_field, AccountCredentials,
    ChannelSection, ResolvedAccount,
};
use crate::channels::adapter::{
    section_account_ids, section_configured, section_enabled, section_webhook_path,
    ChannelPlugin, OutboundContext, Platform,
};
use crate::channels::catalog::{find_channel, ChannelDescriptor, CHANNEL_CATALOG};
use crate::channels::crypto::{compute_signature, verify_signature, MessageCipher};
use crate::channels::envelope::{parse_envelope, render_envelope, Envelope, XmlField};
use crate::channels::error::{ChannelError, Result};
use crate::channels::outbound::{
    check_code, download_media, expires_in, merge_channel_data, resolve_base_url, send_json,
    str_field,
};
use crate::channels::target::{ensure_target, parse_target, TargetPrefix, TargetRules};
use crate::channels::token::{FetchedToken, TokenKey, FALLBACK_EXPIRES_S};
use crate::channels::types::{
    unix_timestamp, CanonicalMessage, ChannelEvent, ChatType, InboundItem, MediaRef,
    OutboundPayload, OutboundTarget, SendResult, TargetKind,
};
use crate::channels::webhook::{
    Inbound, PlatformWebhook, WebhookHandler, WebhookOptions, WebhookProtocol, WebhookResponse,
};
use crate::config::Config;
use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

pub const WECOM_CHANNEL: &str = "wecom";
const DEFAULT_API_HOST: &str = "qyapi.weixin.qq.com";
const ACK: &str = "success";
const TOKEN_REJECTED: [i64; 3] = [40014, 42001, 41001];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WecomAccount {
    #[serde(default, alias = "corpId", alias = "corpid")]
    pub corp_id: String,
    #[serde(
        default,
        alias = "agentId",
        alias = "agentid",
        deserialize_with = "deserialize_string_from_any"
    )]
    pub agent_id: String,
    #[serde(default, alias = "corpSecret", alias = "corpsecret")]
    pub secret: String,
    #[serde(default)]
    pub token: String,
    #[serde(default, alias = "encodingAesKey", alias = "encodingAESKey")]
    pub encoding_aes_key: String,
    #[serde(default, alias = "apiBase")]
    pub api_base: String,
}

impl AccountCredentials for WecomAccount {
    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("corp_id", &self.corp_id),
            ("agent_id", &self.agent_id),
            ("secret", &self.secret),
        ]
    }
}

const TARGET_RULES: TargetRules = TargetRules {
    default_kind: TargetKind::User,
    prefixes: &[
        TargetPrefix::new("user", TargetKind::User),
        TargetPrefix::new("party", TargetKind::Party),
        TargetPrefix::new("tag", TargetKind::Tag),
        TargetPrefix::new("group", TargetKind::Group),
        TargetPrefix::new("chat", TargetKind::Group),
        TargetPrefix::new("room", TargetKind::Room),
    ],
    threaded: false,
};

pub struct WecomPlugin;

impl Platform for WecomPlugin {
    type Account = WecomAccount;

    const CHANNEL: &'static str = WECOM_CHANNEL;

    fn section(config: &Config) -> &ChannelSection<WecomAccount> {
        &config.channels.wecom
    }
}

#[async_trait]
impl WebhookProtocol for WecomPlugin {
    fn accepts(&self, method: &Method) -> bool {
        method == Method::GET || method == Method::POST
    }

    async fn process(&self, inbound: &Inbound<'_, WecomAccount>) -> Result<WebhookResponse> {
        let account = &inbound.account.config;
        let token = require_field(WECOM_CHANNEL, "token", &account.token)?;
        let cipher = MessageCipher::new(require_field(
            WECOM_CHANNEL,
            "encoding_aes_key",
            &account.encoding_aes_key,
        )?)?;
        let request = inbound.request;
        let signature = request
            .query_param("msg_signature")
            .or_else(|| request.query_param("signature"))
            .ok_or_else(|| ChannelError::signature("missing msg_signature"))?;
        let timestamp = request
            .query_param("timestamp")
            .ok_or_else(|| ChannelError::signature("missing timestamp"))?;
        let nonce = request
            .query_param("nonce")
            .ok_or_else(|| ChannelError::signature("missing nonce"))?;

        if request.method == Method::GET {
            // Some proxies decode `+` in echostr as a space.
            let echostr = request
                .query_param("echostr")
                .map(|value| value.replace(' ', "+"))
                .ok_or_else(|| ChannelError::invalid_payload("missing echostr"))?;
            if !verify_signature(token, timestamp, nonce, &echostr, signature) {
                return Err(ChannelError::signature("msg_signature mismatch"));
            }
            let plain = cipher.decrypt(&echostr, account.corp_id.trim())?;
            return Ok(WebhookResponse::text(StatusCode::OK, plain));
        }

        let outer = parse_envelope(request.body_text()?)?;
        let encrypted = outer
            .get("Encrypt")
            .ok_or_else(|| ChannelError::invalid_payload("xml envelope missing Encrypt"))?;
        if !verify_signature(token, timestamp, nonce, encrypted, signature) {
            return Err(ChannelError::signature("msg_signature mismatch"));
        }
        let plain = cipher.decrypt(encrypted, account.corp_id.trim())?;
        let envelope = parse_envelope(&plain)?;
        match parse_inbound(&envelope, inbound.account_id())? {
            InboundItem::Message(message) => {
                let user = message.sender_id.clone();
                let Some(reply) = inbound.deliver_message(message).await else {
                    return Ok(WebhookResponse::text(StatusCode::OK, ACK));
                };
                passive_reply(&cipher, token, nonce, account.corp_id.trim(), &user, &reply)
                    .map(WebhookResponse::xml)
            }
            InboundItem::Event(event) => {
                inbound.deliver_event(event).await;
                Ok(WebhookResponse::text(StatusCode::OK, ACK))
            }
        }
    }
}

/// Decrypted callback XML to a message or an event.
pub fn parse_inbound(envelope: &Envelope, account_id: &str) -> Result<InboundItem> {
    let raw = serde_json::to_value(envelope.fields()).unwrap_or(Value::Null);
    let msg_type = envelope
        .get("MsgType")
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| ChannelError::invalid_payload("wecom payload missing MsgType"))?;
    if msg_type == "event" {
        let event_type = envelope
            .get("Event")
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| "unknown".to_string());
        return Ok(InboundItem::Event(ChannelEvent {
            platform: WECOM_CHANNEL.to_string(),
            account_id: account_id.to_string(),
            event_type,
            payload: raw,
        }));
    }

    let sender = envelope
        .get("FromUserName")
        .ok_or_else(|| ChannelError::invalid_payload("wecom payload missing FromUserName"))?
        .to_string();
    let created = envelope
        .get("CreateTime")
        .and_then(|value| value.parse::<i64>().ok());
    let message_id = envelope
        .get_any(&["MsgId", "MsgID"])
        .map(str::to_string)
        .unwrap_or_else(|| format!("{sender}:{}", created.unwrap_or_default()));
    let mut media = Vec::new();
    let mut push_media = |kind: &str, reference: Option<&str>, name: Option<&str>| {
        if let Some(reference) = reference {
            media.push(MediaRef {
                kind: kind.to_string(),
                reference: reference.to_string(),
                name: name.map(str::to_string),
            });
        }
    };
    let content_text = match msg_type.as_str() {
        "text" => envelope.get("Content").unwrap_or_default().to_string(),
        "image" => {
            push_media("image", envelope.get_any(&["PicUrl", "MediaId"]), None);
            "[image]".to_string()
        }
        "voice" => {
            push_media("voice", envelope.get("MediaId"), None);
            envelope
                .get("Recognition")
                .map(str::to_string)
                .unwrap_or_else(|| "[voice]".to_string())
        }
        "video" | "file" => {
            push_media(&msg_type, envelope.get("MediaId"), envelope.get("FileName"));
            format!("[{msg_type}]")
        }
        "location" => {
            let label = envelope.get("Label").unwrap_or_default();
            format!("[location] {label}").trim().to_string()
        }
        "link" => {
            let title = envelope.get("Title").unwrap_or_default();
            let url = envelope.get("Url").unwrap_or_default();
            format!("{title} {url}").trim().to_string()
        }
        other => format!("[{other}]"),
    };

    Ok(InboundItem::Message(CanonicalMessage {
        platform: WECOM_CHANNEL.to_string(),
        account_id: account_id.to_string(),
        message_id,
        sender_id: sender.clone(),
        sender_name: None,
        chat_id: sender,
        chat_type: ChatType::Direct,
        content_text,
        raw_content_type: msg_type,
        timestamp: unix_timestamp(created),
        mentions: Vec::new(),
        reply_to_id: None,
        media,
        raw,
    }))
}

fn passive_reply(
    cipher: &MessageCipher,
    token: &str,
    nonce: &str,
    corp_id: &str,
    to_user: &str,
    text: &str,
) -> Result<String> {
    let now = chrono::Utc::now().timestamp().to_string();
    let inner = render_envelope(&[
        XmlField::Cdata("ToUserName", to_user),
        XmlField::Cdata("FromUserName", corp_id),
        XmlField::Text("CreateTime", &now),
        XmlField::Cdata("MsgType", "text"),
        XmlField::Cdata("Content", text),
    ]);
    let encrypted = cipher.encrypt(&inner, corp_id)?;
    let signature = compute_signature(token, &now, nonce, &encrypted);
    Ok(render_envelope(&[
        XmlField::Cdata("Encrypt", &encrypted),
        XmlField::Cdata("MsgSignature", &signature),
        XmlField::Text("TimeStamp", &now),
        XmlField::Cdata("Nonce", nonce),
    ]))
}

fn api_base(account: &WecomAccount) -> String {
    resolve_base_url(&account.api_base, DEFAULT_API_HOST)
}

fn token_key(account: &ResolvedAccount<WecomAccount>) -> TokenKey {
    let config = &account.config;
    TokenKey::new(
        WECOM_CHANNEL,
        &account.account_id,
        &[&api_base(config), &config.corp_id, &config.secret],
    )
}

async fn access_token(
    context: OutboundContext<'_>,
    account: &ResolvedAccount<WecomAccount>,
) -> Result<String> {
    let http = context.http.clone();
    let base_url = api_base(&account.config);
    let corp_id = account.config.corp_id.trim().to_string();
    let secret = account.config.secret.trim().to_string();
    context
        .tokens
        .get_or_fetch(&token_key(account), move || async move {
            fetch_access_token(&http, &base_url, &corp_id, &secret).await
        })
        .await
}

async fn fetch_access_token(
    http: &Client,
    base_url: &str,
    corp_id: &str,
    secret: &str,
) -> Result<FetchedToken> {
    let body = send_json(
        WECOM_CHANNEL,
        http.get(format!("{base_url}/cgi-bin/gettoken"))
            .query(&[("corpid", corp_id), ("corpsecret", secret)]),
    )
    .await?;
    check_code(WECOM_CHANNEL, &body, "errcode")?;
    let token = str_field(&body, "access_token")
        .ok_or_else(|| ChannelError::vendor(WECOM_CHANNEL, -1, "token missing access_token"))?;
    Ok(FetchedToken::new(
        token,
        expires_in(body.get("expires_in"), FALLBACK_EXPIRES_S),
    ))
}

async fn upload_image(
    http: &Client,
    base_url: &str,
    access_token: &str,
    media_url: &str,
) -> Result<String> {
    let media = download_media(http, WECOM_CHANNEL, media_url).await?;
    let part = Part::bytes(media.bytes)
        .file_name(media.file_name)
        .mime_str(&media.content_type)
        .map_err(|err| ChannelError::invalid_payload(format!("media content type: {err}")))?;
    let body = send_json(
        WECOM_CHANNEL,
        http.post(format!("{base_url}/cgi-bin/media/upload"))
            .query(&[("access_token", access_token), ("type", "image")])
            .multipart(Form::new().part("media", part)),
    )
    .await?;
    check_code(WECOM_CHANNEL, &body, "errcode")?;
    str_field(&body, "media_id")
        .map(str::to_string)
        .ok_or_else(|| ChannelError::vendor(WECOM_CHANNEL, -1, "upload missing media_id"))
}

fn message_body(account: &WecomAccount, target: &OutboundTarget, content: Value) -> Value {
    let mut body = content;
    let Some(map) = body.as_object_mut() else {
        return body;
    };
    let id = Value::String(target.id.clone());
    match target.kind {
        TargetKind::Group | TargetKind::Room => {
            map.insert("chatid".to_string(), id);
        }
        TargetKind::Party => {
            map.insert("toparty".to_string(), id);
        }
        TargetKind::Tag => {
            map.insert("totag".to_string(), id);
        }
        TargetKind::User | TargetKind::Channel => {
            map.insert("touser".to_string(), id);
        }
    }
    if !target.kind.is_group_like() {
        let agent_id = account.agent_id.trim();
        let agent_id = agent_id
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(agent_id.to_string()));
        map.insert("agentid".to_string(), agent_id);
        map.insert("safe".to_string(), json!(0));
    }
    body
}

async fn post_message(
    context: OutboundContext<'_>,
    account: &ResolvedAccount<WecomAccount>,
    access_token: &str,
    target: &OutboundTarget,
    body: Value,
) -> Result<String> {
    let base_url = api_base(&account.config);
    let path = if target.kind.is_group_like() {
        "/cgi-bin/appchat/send"
    } else {
        "/cgi-bin/message/send"
    };
    let response = send_json(
        WECOM_CHANNEL,
        context
            .http
            .post(format!("{base_url}{path}"))
            .query(&[("access_token", access_token)])
            .json(&body),
    )
    .await?;
    if let Err(err) = check_code(WECOM_CHANNEL, &response, "errcode") {
        if matches!(&err, ChannelError::VendorApi { code, .. } if TOKEN_REJECTED.contains(code)) {
            context.tokens.invalidate(&token_key(account));
        }
        return Err(err);
    }
    Ok(str_field(&response, "msgid")
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()))
}

#[async_trait]
impl ChannelPlugin for WecomPlugin {
    fn descriptor(&self) -> &'static ChannelDescriptor {
        find_channel(WECOM_CHANNEL).unwrap_or(&CHANNEL_CATALOG[0])
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
        Arc::new(PlatformWebhook::new(WecomPlugin, options))
    }

    async fn send_payload(
        &self,
        context: OutboundContext<'_>,
        to: &str,
        payload: &OutboundPayload,
    ) -> Result<SendResult> {
        let account = Self::resolve(context.config, context.account_id);
        ensure_configured(WECOM_CHANNEL, &account)?;
        let target = self.parse_target(to);
        ensure_target(&target)?;
        let text = payload.text_body();
        let media_url = payload.media_url.as_deref().map(str::trim).filter(|v| !v.is_empty());
        if text.is_empty() && media_url.is_none() {
            return Err(ChannelError::invalid_payload("message has no text or media"));
        }

        let access_token = access_token(context, &account).await?;
        let mut message_id = String::new();
        if !text.is_empty() {
            let content = if payload.wants_markdown() {
                json!({ "msgtype": "markdown", "markdown": { "content": text } })
            } else {
                json!({ "msgtype": "text", "text": { "content": text } })
            };
            let mut body = message_body(&account.config, &target, content);
            if media_url.is_none() {
                merge_channel_data(&mut body, payload.channel_data.as_ref());
            }
            message_id = post_message(context, &account, &access_token, &target, body).await?;
        }
        if let Some(media_url) = media_url {
            let base_url = api_base(&account.config);
            let media_id = upload_image(context.http, &base_url, &access_token, media_url).await?;
            let content = json!({ "msgtype": "image", "image": { "media_id": media_id } });
            let mut body = message_body(&account.config, &target, content);
            merge_channel_data(&mut body, payload.channel_data.as_ref());
            message_id = post_message(context, &account, &access_token, &target, body).await?;
        }
        Ok(SendResult::new(WECOM_CHANNEL, &message_id, &target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_map_to_wecom_scopes() {
        let plugin = WecomPlugin;
        assert_eq!(plugin.parse_target("zhangsan").kind, TargetKind::User);
        assert_eq!(plugin.parse_target("party:2").kind, TargetKind::Party);
        assert_eq!(plugin.parse_target("tag:7").kind, TargetKind::Tag);
        let chat = plugin.parse_target("chat:wrOg:extra");
        assert_eq!(chat.kind, TargetKind::Group);
        assert_eq!(chat.id, "wrOg:extra");
    }

    #[test]
    fn message_body_routes_scope_fields() {
        let account = WecomAccount {
            agent_id: "1000002".to_string(),
            ..WecomAccount::default()
        };
        let content = json!({ "msgtype": "text", "text": { "content": "hi" } });
        let body = message_body(
            &account,
            &OutboundTarget::new(TargetKind::Party, "2"),
            content.clone(),
        );
        assert_eq!(body["toparty"], "2");
        assert_eq!(body["agentid"], 1000002);
        let body = message_body(&account, &OutboundTarget::new(TargetKind::Group, "wr1"), content);
        assert_eq!(body["chatid"], "wr1");
        assert!(body.get("agentid").is_none());
    }

    #[test]
    fn text_message_parses_into_canonical_shape() {
        let envelope = parse_envelope(
            "<xml><ToUserName><![CDATA[ww1]]></ToUserName><FromUserName><![CDATA[lisi]]></FromUserName>\
<CreateTime>1348831860</CreateTime><MsgType><![CDATA[text]]></MsgType>\
<Content><![CDATA[hello]]></Content><MsgId>1234567890123456</MsgId><AgentID>1</AgentID></xml>",
        )
        .unwrap();
        let InboundItem::Message(message) = parse_inbound(&envelope, "default").unwrap() else {
            panic!("expected message");
        };
        assert_eq!(message.platform, "wecom");
        assert_eq!(message.message_id, "1234567890123456");
        assert_eq!(message.sender_id, "lisi");
        assert_eq!(message.chat_id, "lisi");
        assert_eq!(message.chat_type, ChatType::Direct);
        assert_eq!(message.content_text, "hello");
        assert_eq!(message.timestamp.timestamp(), 1348831860);
        assert_eq!(message.raw["AgentID"], "1");
    }

    #[test]
    fn event_payload_stays_typed() {
        let envelope = parse_envelope(
            "<xml><FromUserName>lisi</FromUserName><MsgType>event</MsgType>\
<Event>change_contact</Event><ChangeType>create_user</ChangeType></xml>",
        )
        .unwrap();
        let InboundItem::Event(event) = parse_inbound(&envelope, "sales").unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.event_type, "change_contact");
        assert_eq!(event.account_id, "sales");
        assert_eq!(event.payload["ChangeType"], "create_user");
    }

    #[test]
    fn passive_reply_is_signed_and_decryptable() {
        let key = "jWmYm7qr5nMoAUwZRjGtBxmz3KA1tkAj3ykkR6q2B2C";
        let cipher = MessageCipher::new(key).unwrap();
        let xml = passive_reply(&cipher, "tok", "n1", "ww1", "lisi", "pong").unwrap();
        let outer = parse_envelope(&xml).unwrap();
        let encrypted = outer.get("Encrypt").unwrap();
        let timestamp = outer.get("TimeStamp").unwrap();
        assert!(verify_signature(
            "tok",
            timestamp,
            "n1",
            encrypted,
            outer.get("MsgSignature").unwrap()
        ));
        let inner = parse_envelope(&cipher.decrypt(encrypted, "ww1").unwrap()).unwrap();
        assert_eq!(inner.get("Content"), Some("pong"));
        assert_eq!(inner.get("ToUserName"), Some("lisi"));
    }
}
