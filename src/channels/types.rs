use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Direct,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: String,
    /// URL, media id or file key, depending on the platform.
    pub reference: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Platform-agnostic inbound chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMessage {
    pub platform: String,
    pub account_id: String,
    pub message_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub chat_id: String,
    pub chat_type: ChatType,
    pub content_text: String,
    pub raw_content_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub mentions: Vec<Mention>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    #[serde(default)]
    pub raw: Value,
}

/// Inbound payloads that are not chat messages (membership changes, menu clicks, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEvent {
    pub platform: String,
    pub account_id: String,
    pub event_type: String,
    pub payload: Value,
}

/// Result of parsing one inbound delivery.
#[derive(Debug, Clone)]
pub enum InboundItem {
    Message(CanonicalMessage),
    Event(ChannelEvent),
}

/// Vendors send seconds or milliseconds; anything unparseable becomes "now".
pub fn unix_timestamp(value: Option<i64>) -> DateTime<Utc> {
    let Some(value) = value.filter(|value| *value > 0) else {
        return Utc::now();
    };
    let parsed = if value > 100_000_000_000 {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    };
    parsed.unwrap_or_else(Utc::now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    User,
    Group,
    Channel,
    Room,
    Party,
    Tag,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::Channel => "channel",
            Self::Room => "room",
            Self::Party => "party",
            Self::Tag => "tag",
        }
    }

    pub fn is_group_like(self) -> bool {
        matches!(self, Self::Group | Self::Room)
    }
}

/// Parsed recipient of an outbound call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundTarget {
    pub kind: TargetKind,
    pub id: String,
    #[serde(default)]
    pub reply_to_message_id: Option<String>,
    /// QQ guild direct messages travel on the channel API with a guild id.
    #[serde(default)]
    pub direct: bool,
}

impl OutboundTarget {
    pub fn new(kind: TargetKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            reply_to_message_id: None,
            direct: false,
        }
    }

    pub fn with_reply(mut self, message_id: Option<String>) -> Self {
        self.reply_to_message_id = message_id;
        self
    }
}

impl fmt::Display for OutboundTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.direct {
            write!(f, "dm:{}", self.id)
        } else {
            write!(f, "{}:{}", self.kind.as_str(), self.id)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextFormat {
    #[default]
    Auto,
    Text,
    Markdown,
}

/// Everything `send_payload` can carry; `send_text` and `send_media` build one of these.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundPayload {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub format: TextFormat,
    /// Vendor-native body merged over the generated one.
    #[serde(default)]
    pub channel_data: Option<Value>,
}

impl OutboundPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn media(text: impl Into<String>, media_url: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()).filter(|value: &String| !value.trim().is_empty()),
            media_url: Some(media_url.into()),
            ..Self::default()
        }
    }

    pub fn text_body(&self) -> &str {
        self.text.as_deref().map(str::trim).unwrap_or("")
    }

    pub fn wants_markdown(&self) -> bool {
        match self.format {
            TextFormat::Markdown => true,
            TextFormat::Text => false,
            TextFormat::Auto => looks_like_markdown(self.text_body()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub channel: String,
    pub message_id: String,
    pub chat_id: String,
}

impl SendResult {
    pub fn new(channel: &str, vendor_message_id: &str, target: &OutboundTarget) -> Self {
        Self {
            channel: channel.to_string(),
            message_id: format!("{channel}:{vendor_message_id}"),
            chat_id: target.to_string(),
        }
    }
}

pub fn looks_like_markdown(text: &str) -> bool {
    if text.contains("```") || text.contains("**") || text.contains("](") {
        return true;
    }
    text.lines().any(|line| {
        let line = line.trim_start();
        line.starts_with("# ")
            || line.starts_with("## ")
            || line.starts_with("### ")
            || line.starts_with("- ")
            || line.starts_with("* ")
            || line.starts_with("> ")
            || (line.starts_with('|') && line.ends_with('|') && line.len() > 1)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_display_is_kind_prefixed() {
        assert_eq!(
            OutboundTarget::new(TargetKind::Group, "987654").to_string(),
            "group:987654"
        );
        let mut dm = OutboundTarget::new(TargetKind::Channel, "guild_1");
        dm.direct = true;
        assert_eq!(dm.to_string(), "dm:guild_1");
    }

    #[test]
    fn send_result_prefixes_message_id() {
        let target = OutboundTarget::new(TargetKind::User, "u1");
        let result = SendResult::new("wecom", "msg_9", &target);
        assert_eq!(result.message_id, "wecom:msg_9");
        assert_eq!(result.chat_id, "user:u1");
    }

    #[test]
    fn markdown_detection() {
        assert!(looks_like_markdown("# Title\nbody"));
        assert!(looks_like_markdown("see [docs](https://example.com)"));
        assert!(looks_like_markdown("some **bold** text"));
        assert!(looks_like_markdown("| a | b |\n|---|---|"));
        assert!(!looks_like_markdown("plain hello #1 - ok"));
        assert!(!looks_like_markdown(""));
    }

    #[test]
    fn timestamps_accept_seconds_and_millis() {
        assert_eq!(unix_timestamp(Some(1_348_831_860)).timestamp(), 1_348_831_860);
        assert_eq!(
            unix_timestamp(Some(1_700_000_000_123)).timestamp_millis(),
            1_700_000_000_123
        );
        let before = Utc::now();
        assert!(unix_timestamp(None) >= before);
    }

    #[test]
    fn payload_format_overrides_detection() {
        let mut payload = OutboundPayload::text("# heading");
        assert!(payload.wants_markdown());
        payload.format = TextFormat::Text;
        assert!(!payload.wants_markdown());
        let media = OutboundPayload::media("  ", "https://example.com/a.png");
        assert!(media.text.is_none());
    }
}
