use crate::channels::types::ChatType;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDescriptor {
    pub id: &'static str,
    pub label: &'static str,
    pub aliases: &'static [&'static str],
    pub chat_types: &'static [ChatType],
    pub supports_media: bool,
    pub text_chunk_limit: usize,
    pub docs_hint: &'static str,
}

const DIRECT_AND_GROUP: &[ChatType] = &[ChatType::Direct, ChatType::Group];

/// Declared order is listing order.
pub const CHANNEL_CATALOG: &[ChannelDescriptor] = &[
    ChannelDescriptor {
        id: "wecom",
        label: "WeCom",
        aliases: &["wechat-work", "wechat_work", "wework", "wxwork", "qywx"],
        chat_types: DIRECT_AND_GROUP,
        supports_media: true,
        text_chunk_limit: 2048,
        docs_hint: "/channels/wecom/webhook",
    },
    ChannelDescriptor {
        id: "dingtalk",
        label: "DingTalk",
        aliases: &["ding", "dingding"],
        chat_types: DIRECT_AND_GROUP,
        supports_media: true,
        text_chunk_limit: 4000,
        docs_hint: "/channels/dingtalk/webhook",
    },
    ChannelDescriptor {
        id: "feishu",
        label: "Feishu",
        aliases: &["lark"],
        chat_types: DIRECT_AND_GROUP,
        supports_media: true,
        text_chunk_limit: 4000,
        docs_hint: "/channels/feishu/webhook",
    },
    ChannelDescriptor {
        id: "onebot",
        label: "QQ (OneBot)",
        aliases: &["qq", "cqhttp", "go-cqhttp", "napcat", "lagrange"],
        chat_types: DIRECT_AND_GROUP,
        supports_media: true,
        text_chunk_limit: 4500,
        docs_hint: "/channels/onebot/webhook",
    },
    ChannelDescriptor {
        id: "qqbot",
        label: "QQ Bot",
        aliases: &["qq-bot", "qq_bot", "qqofficial", "qq-official"],
        chat_types: DIRECT_AND_GROUP,
        supports_media: true,
        text_chunk_limit: 2000,
        docs_hint: "/channels/qqbot/webhook",
    },
];

/// Resolves an id or alias without touching any plugin object.
pub fn find_channel(channel: &str) -> Option<&'static ChannelDescriptor> {
    let normalized = channel.trim();
    if normalized.is_empty() {
        return None;
    }
    CHANNEL_CATALOG.iter().find(|item| {
        item.id.eq_ignore_ascii_case(normalized)
            || item
                .aliases
                .iter()
                .any(|alias| alias.eq_ignore_ascii_case(normalized))
    })
}

pub fn normalize_channel_id(channel: &str) -> Option<&'static str> {
    find_channel(channel).map(|item| item.id)
}

pub fn channel_ids() -> Vec<&'static str> {
    CHANNEL_CATALOG.iter().map(|item| item.id).collect()
}

pub fn default_webhook_path(channel: &str) -> String {
    format!("/channels/{}/webhook", channel.trim().to_ascii_lowercase())
}
