use crate::channels::account::{
    deserialize_string_from_any, ensure_configured, AccountCredentials, ChannelSection,
};
use crate::channels::adapter::{
    section_account_ids, section_configured, section_enabled, section_webhook_path,
    ChannelPlugin, OutboundContext, Platform,
};
use crate::channels::catalog::{find_channel, ChannelDescriptor, CHANNEL_CATALOG};
use crate::channels::crypto::{constant_time_eq, hmac_sha1_hex};
use crate::channels::error::{ChannelError, Result};
use crate::channels::outbound::{check_code, id_string, merge_channel_data, send_json, str_field};
use crate::channels::target::{ensure_target, parse_target, TargetPrefix, TargetRules};
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
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use tracing::error;

pub const ONEBOT_CHANNEL: &str = "onebot";
const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnebotAccount {
    /// Base URL of the OneBot HTTP API (go-cqhttp, NapCat, Lagrange).
    #[serde(default, alias = "httpUrl", alias = "api_url", alias = "apiUrl")]
    pub http_url: String,
    #[serde(default, alias = "accessToken", deserialize_with = "deserialize_string_from_any")]
    pub access_token: String,
    #[serde(default, deserialize_with = "deserialize_string_from_any")]
    pub secret: String,
}

impl AccountCredentials for OnebotAccount {
    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![("http_url", &self.http_url)]
    }
}

const TARGET_RULES: TargetRules = TargetRules {
    default_kind: TargetKind::User,
    prefixes: &[
        TargetPrefix::new("private", TargetKind::User),
        TargetPrefix::new("user", TargetKind::User),
        TargetPrefix::new("group", TargetKind::Group),
        TargetPrefix::new("room", TargetKind::Room),
    ],
    threaded: true,
};

pub struct OnebotPlugin;

impl Platform for OnebotPlugin {
    type Account = OnebotAccount;

    const CHANNEL: &'static str = ONEBOT_CHANNEL;

    fn section(config: &Config) -> &ChannelSection<OnebotAccount> {
        &config.channels.onebot
    }
}

#[async_trait]
impl WebhookProtocol for OnebotPlugin {
    async fn process(&self, inbound: &Inbound<'_, OnebotAccount>) -> Result<WebhookResponse> {
        let secret = inbound.account.config.secret.trim();
        if !secret.is_empty() {
            verify_signature(inbound.request, secret)?;
        }
        let body = inbound.request.json()?;
        match parse_post(&body, inbound.account_id())? {
            InboundItem::Message(message) => {
                let group = message.chat_type == ChatType::Group;
                match inbound.deliver_message(message).await {
                    Some(reply) => Ok(WebhookResponse::json(
                        StatusCode::OK,
                        &quick_reply(&reply, group),
                    )),
                    None => Ok(WebhookResponse::no_content()),
                }
            }
            InboundItem::Event(event) => {
                inbound.deliver_event(event).await;
                Ok(WebhookResponse::no_content())
            }
        }
    }
}

pub fn verify_signature(request: &WebhookRequest, secret: &str) -> Result<()> {
    let provided = request
        .header(SIGNATURE_HEADER)
        .ok_or_else(|| ChannelError::signature("missing X-Signature"))?;
    let provided = provided.strip_prefix("sha1=").unwrap_or(provided);
    let expected = hmac_sha1_hex(secret, &request.body);
    if !constant_time_eq(&expected, &provided.to_ascii_lowercase()) {
        return Err(ChannelError::signature("X-Signature mismatch"));
    }
    Ok(())
}

fn quick_reply(text: &str, group: bool) -> Value {
    if group {
        json!({ "reply": text, "at_sender": false })
    } else {
        json!({ "reply": text })
    }
}

pub fn parse_post(body: &Value, account_id: &str) -> Result<InboundItem> {
    let post_type = str_field(body, "post_type")
        .ok_or_else(|| ChannelError::invalid_payload("onebot payload missing post_type"))?;
    if post_type != "message" && post_type != "message_sent" {
        let detail = ["notice_type", "request_type", "meta_event_type"]
            .iter()
            .find_map(|field| str_field(body, field));
        let event_type = match detail {
            Some(detail) => format!("{post_type}.{detail}"),
            None => post_type.to_string(),
        };
        return Ok(InboundItem::Event(ChannelEvent {
            platform: ONEBOT_CHANNEL.to_string(),
            account_id: account_id.to_string(),
            event_type,
            payload: body.clone(),
        }));
    }
    parse_message(body, account_id).map(InboundItem::Message)
}

/// One OneBot v11 message segment, normalized from either wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    kind: String,
    data: Vec<(String, String)>,
}

impl Segment {
    fn raw(&self, key: &str) -> Option<&str> {
        self.data
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.raw(key)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

fn segments_from_value(message: &Value) -> Vec<Segment> {
    match message {
        Value::String(raw) => parse_cq_string(raw),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let kind = str_field(item, "type")?.to_string();
                let data = item
                    .get("data")
                    .and_then(Value::as_object)
                    .map(|map| {
                        map.iter()
                            .filter_map(|(key, value)| {
                                let value = match value {
                                    Value::String(text) => text.clone(),
                                    Value::Number(number) => number.to_string(),
                                    Value::Bool(flag) => flag.to_string(),
                                    _ => return None,
                                };
                                Some((key.clone(), value))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Some(Segment { kind, data })
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn cq_code_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| match Regex::new(r"\[CQ:([A-Za-z_]+)((?:,[^\]]*)?)\]") {
        Ok(regex) => Some(regex),
        Err(err) => {
            error!("cq code regex compile failed: {err}");
            None
        }
    })
    .as_ref()
}

fn cq_unescape(text: &str) -> String {
    text.replace("&#91;", "[")
        .replace("&#93;", "]")
        .replace("&#44;", ",")
        .replace("&amp;", "&")
}

/// Splits a CQ-code string such as `[CQ:at,qq=10001] hi` into segments.
fn parse_cq_string(raw: &str) -> Vec<Segment> {
    let text_segment = |text: &str| Segment {
        kind: "text".to_string(),
        data: vec![("text".to_string(), cq_unescape(text))],
    };
    let Some(regex) = cq_code_regex() else {
        return vec![text_segment(raw)];
    };
    let mut segments = Vec::new();
    let mut cursor = 0;
    for captures in regex.captures_iter(raw) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        if whole.start() > cursor {
            segments.push(text_segment(&raw[cursor..whole.start()]));
        }
        let data = captures
            .get(2)
            .map(|params| {
                params
                    .as_str()
                    .split(',')
                    .filter_map(|pair| pair.split_once('='))
                    .map(|(key, value)| (key.trim().to_string(), cq_unescape(value)))
                    .collect()
            })
            .unwrap_or_default();
        segments.push(Segment {
            kind: captures[1].to_ascii_lowercase(),
            data,
        });
        cursor = whole.end();
    }
    if cursor < raw.len() {
        segments.push(text_segment(&raw[cursor..]));
    }
    segments
}

fn parse_message(body: &Value, account_id: &str) -> Result<CanonicalMessage> {
    let sender_id = id_string(body.get("user_id"))
        .ok_or_else(|| ChannelError::invalid_payload("onebot message missing user_id"))?;
    let group_id = id_string(body.get("group_id"));
    let (chat_type, chat_id) = match (str_field(body, "message_type"), group_id) {
        (Some("group"), Some(group_id)) => (ChatType::Group, group_id),
        _ => (ChatType::Direct, sender_id.clone()),
    };
    let sender = body.get("sender").cloned().unwrap_or(Value::Null);
    let sender_name = str_field(&sender, "card")
        .or_else(|| str_field(&sender, "nickname"))
        .map(str::to_string);

    let segments = body
        .get("message")
        .map(segments_from_value)
        .filter(|segments| !segments.is_empty())
        .or_else(|| body.get("raw_message").map(segments_from_value))
        .unwrap_or_default();
    let mut text = String::new();
    let mut mentions = Vec::new();
    let mut media = Vec::new();
    let mut reply_to_id = None;
    let mut kinds = Vec::new();
    for segment in &segments {
        if !kinds.contains(&segment.kind.as_str()) {
            kinds.push(segment.kind.as_str());
        }
        match segment.kind.as_str() {
            "text" => text.push_str(segment.raw("text").unwrap_or_default()),
            "at" => {
                if let Some(qq) = segment.get("qq") {
                    mentions.push(Mention {
                        id: qq.to_string(),
                        name: segment.get("name").map(str::to_string),
                    });
                }
            }
            "reply" => reply_to_id = segment.get("id").map(str::to_string),
            "image" | "record" | "video" | "file" => {
                let reference = segment.get("url").or_else(|| segment.get("file"));
                if let Some(reference) = reference {
                    media.push(MediaRef {
                        kind: segment.kind.clone(),
                        reference: reference.to_string(),
                        name: segment.get("name").map(str::to_string),
                    });
                }
            }
            _ => {}
        }
    }
    let raw_content_type = match kinds.as_slice() {
        [] => "text".to_string(),
        [only] => only.to_string(),
        _ if media.is_empty() => "text".to_string(),
        _ => "mixed".to_string(),
    };
    let message_id = id_string(body.get("message_id"))
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    Ok(CanonicalMessage {
        platform: ONEBOT_CHANNEL.to_string(),
        account_id: account_id.to_string(),
        message_id,
        sender_id,
        sender_name,
        chat_id,
        chat_type,
        content_text: text.trim().to_string(),
        raw_content_type,
        timestamp: unix_timestamp(body.get("time").and_then(Value::as_i64)),
        mentions,
        reply_to_id,
        media,
        raw: body.clone(),
    })
}

/// OneBot implementations accept ids as numbers; keep non-numeric ids as strings.
fn numeric_or_string(id: &str) -> Value {
    id.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(id))
}

fn message_segments(target: &OutboundTarget, payload: &OutboundPayload) -> Vec<Value> {
    let mut segments = Vec::new();
    if let Some(reply_to) = target.reply_to_message_id.as_deref() {
        segments.push(json!({ "type": "reply", "data": { "id": reply_to } }));
    }
    let text = payload.text_body();
    if !text.is_empty() {
        segments.push(json!({ "type": "text", "data": { "text": text } }));
    }
    if let Some(url) = payload
        .media_url
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        segments.push(json!({ "type": "image", "data": { "file": url } }));
    }
    segments
}

fn send_request(target: &OutboundTarget, message: Vec<Value>) -> (&'static str, Value) {
    if target.kind.is_group_like() {
        (
            "send_group_msg",
            json!({ "group_id": numeric_or_string(&target.id), "message": message }),
        )
    } else {
        (
            "send_private_msg",
            json!({ "user_id": numeric_or_string(&target.id), "message": message }),
        )
    }
}

#[async_trait]
impl ChannelPlugin for OnebotPlugin {
    fn descriptor(&self) -> &'static ChannelDescriptor {
        find_channel(ONEBOT_CHANNEL).unwrap_or(&CHANNEL_CATALOG[3])
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
        Arc::new(PlatformWebhook::new(OnebotPlugin, options))
    }

    async fn send_payload(
        &self,
        context: OutboundContext<'_>,
        to: &str,
        payload: &OutboundPayload,
    ) -> Result<SendResult> {
        let account = Self::resolve(context.config, context.account_id);
        ensure_configured(ONEBOT_CHANNEL, &account)?;
        let target = self.parse_target(to);
        ensure_target(&target)?;
        let segments = message_segments(&target, payload);
        if !segments
            .iter()
            .any(|segment| segment["type"] != "reply")
        {
            return Err(ChannelError::invalid_payload("message has no text or media"));
        }
        let (action, mut body) = send_request(&target, segments);
        merge_channel_data(&mut body, payload.channel_data.as_ref());
        let base_url = account.config.http_url.trim().trim_end_matches('/');
        let mut request = context.http.post(format!("{base_url}/{action}")).json(&body);
        let access_token = account.config.access_token.trim();
        if !access_token.is_empty() {
            request = request.bearer_auth(access_token);
        }
        let response = send_json(ONEBOT_CHANNEL, request).await?;
        check_code(ONEBOT_CHANNEL, &response, "retcode")?;
        let message_id = id_string(response.get("data").and_then(|data| data.get("message_id")))
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        Ok(SendResult::new(ONEBOT_CHANNEL, &message_id, &target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue, Method, Uri};
    use bytes::Bytes;

    fn group_message() -> Value {
        json!({
            "time": 1718000000,
            "self_id": 10000,
            "post_type": "message",
            "message_type": "group",
            "sub_type": "normal",
            "message_id": -2147483000,
            "group_id": 987654,
            "user_id": 123456,
            "message": [
                { "type": "reply", "data": { "id": "555" } },
                { "type": "at", "data": { "qq": "10000" } },
                { "type": "text", "data": { "text": " hello " } },
                { "type": "image", "data": { "file": "abc.image", "url": "https://gchat.qpic.cn/abc" } }
            ],
            "raw_message": "[CQ:reply,id=555][CQ:at,qq=10000] hello ",
            "sender": { "user_id": 123456, "nickname": "alice", "card": "Alice W" }
        })
    }

    #[test]
    fn segment_array_message_parses() {
        let InboundItem::Message(message) = parse_post(&group_message(), "default").unwrap()
        else {
            panic!("expected message");
        };
        assert_eq!(message.chat_type, ChatType::Group);
        assert_eq!(message.chat_id, "987654");
        assert_eq!(message.sender_id, "123456");
        assert_eq!(message.sender_name.as_deref(), Some("Alice W"));
        assert_eq!(message.message_id, "-2147483000");
        assert_eq!(message.content_text, "hello");
        assert_eq!(message.mentions[0].id, "10000");
        assert_eq!(message.reply_to_id.as_deref(), Some("555"));
        assert_eq!(message.media[0].reference, "https://gchat.qpic.cn/abc");
        assert_eq!(message.raw_content_type, "mixed");
    }

    #[test]
    fn cq_string_message_parses() {
        let body = json!({
            "post_type": "message",
            "message_type": "private",
            "user_id": 42,
            "message_id": 7,
            "message": "[CQ:reply,id=9]see &#91;this&#93;[CQ:face,id=14]"
        });
        let InboundItem::Message(message) = parse_post(&body, "default").unwrap() else {
            panic!("expected message");
        };
        assert_eq!(message.chat_type, ChatType::Direct);
        assert_eq!(message.chat_id, "42");
        assert_eq!(message.content_text, "see [this]");
        assert_eq!(message.reply_to_id.as_deref(), Some("9"));
    }

    #[test]
    fn non_message_posts_become_events() {
        let body = json!({ "post_type": "notice", "notice_type": "group_increase", "group_id": 1 });
        let InboundItem::Event(event) = parse_post(&body, "default").unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.event_type, "notice.group_increase");
        assert!(parse_post(&json!({}), "default").is_err());
    }

    #[test]
    fn signature_header_is_checked() {
        let body = Bytes::from_static(br#"{"post_type":"meta_event"}"#);
        let mut headers = HeaderMap::new();
        let signature = format!("sha1={}", hmac_sha1_hex("s3cret", &body));
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&signature).unwrap());
        let uri: Uri = "/channels/onebot/webhook".parse().unwrap();
        let request = WebhookRequest::new(Method::POST, &uri, headers, body.clone());
        assert!(verify_signature(&request, "s3cret").is_ok());
        assert_eq!(
            verify_signature(&request, "other").unwrap_err().code(),
            "SIGNATURE_INVALID"
        );
        let bare = WebhookRequest::new(Method::POST, &uri, HeaderMap::new(), body);
        assert!(verify_signature(&bare, "s3cret").is_err());
    }

    #[test]
    fn outbound_body_uses_numeric_ids_and_segments() {
        let plugin = OnebotPlugin;
        let target = plugin.parse_target("group:987654:321");
        let payload = OutboundPayload::media("look", "https://example.com/a.png");
        let (action, body) = send_request(&target, message_segments(&target, &payload));
        assert_eq!(action, "send_group_msg");
        assert_eq!(body["group_id"], 987654);
        assert_eq!(body["message"][0]["type"], "reply");
        assert_eq!(body["message"][0]["data"]["id"], "321");
        assert_eq!(body["message"][1]["data"]["text"], "look");
        assert_eq!(body["message"][2]["data"]["file"], "https://example.com/a.png");

        let target = plugin.parse_target("u_abc");
        let (action, body) =
            send_request(&target, message_segments(&target, &OutboundPayload::text("hi")));
        assert_eq!(action, "send_private_msg");
        assert_eq!(body["user_id"], "u_abc");
    }

    #[test]
    fn quick_reply_skips_at_for_direct_chats() {
        assert_eq!(quick_reply("ok", false), json!({ "reply": "ok" }));
        assert_eq!(quick_reply("ok", true)["at_sender"], false);
    }
}
