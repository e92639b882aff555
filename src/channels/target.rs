use crate::channels::error::{ChannelError, Result};
use crate::channels::types::{OutboundTarget, TargetKind};

#[derive(Debug, Clone, Copy)]
pub struct TargetPrefix {
    pub prefix: &'static str,
    pub kind: TargetKind,
    pub direct: bool,
}

impl TargetPrefix {
    pub const fn new(prefix: &'static str, kind: TargetKind) -> Self {
        Self {
            prefix,
            kind,
            direct: false,
        }
    }

    pub const fn direct(prefix: &'static str, kind: TargetKind) -> Self {
        Self {
            prefix,
            kind,
            direct: true,
        }
    }
}

/// Per-platform prefix conventions for the free-form `to` string.
#[derive(Debug, Clone, Copy)]
pub struct TargetRules {
    pub default_kind: TargetKind,
    pub prefixes: &'static [TargetPrefix],
    /// Whether a trailing `:msgId` segment selects a threaded reply.
    pub threaded: bool,
}

/// Total over every input: unknown prefixes fall back to the default kind.
pub fn parse_target(raw: &str, rules: &TargetRules) -> OutboundTarget {
    let trimmed = raw.trim();
    let (kind, direct, rest) = match trimmed.split_once(':') {
        Some((head, rest)) => match rules
            .prefixes
            .iter()
            .find(|item| item.prefix.eq_ignore_ascii_case(head.trim()))
        {
            Some(item) => (item.kind, item.direct, rest.trim()),
            None => (rules.default_kind, false, trimmed),
        },
        None => (rules.default_kind, false, trimmed),
    };
    let (id, reply) = if rules.threaded {
        match rest.rsplit_once(':') {
            Some((id, message_id)) if !id.trim().is_empty() && !message_id.trim().is_empty() => {
                (id.trim(), Some(message_id.trim().to_string()))
            }
            _ => (rest, None),
        }
    } else {
        (rest, None)
    };
    let mut target = OutboundTarget::new(kind, id).with_reply(reply);
    target.direct = direct;
    target
}

/// Parsing is total, but a send still needs a recipient.
pub fn ensure_target(target: &OutboundTarget) -> Result<()> {
    if target.id.trim().is_empty() {
        return Err(ChannelError::invalid_payload(format!(
            "target {} has no id",
            target.kind.as_str()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: TargetRules = TargetRules {
        default_kind: TargetKind::User,
        prefixes: &[
            TargetPrefix::new("user", TargetKind::User),
            TargetPrefix::new("group", TargetKind::Group),
            TargetPrefix::new("room", TargetKind::Room),
            TargetPrefix::direct("dm", TargetKind::Channel),
        ],
        threaded: true,
    };

    #[test]
    fn prefixes_select_kind() {
        let target = parse_target("group:987654", &RULES);
        assert_eq!(target.kind, TargetKind::Group);
        assert_eq!(target.id, "987654");
        assert_eq!(target.reply_to_message_id, None);
        assert_eq!(parse_target("GROUP:1", &RULES).kind, TargetKind::Group);
        assert!(parse_target("dm:guild", &RULES).direct);
    }

    #[test]
    fn trailing_segment_is_reply_id() {
        let target = parse_target("group:987654:msg_1", &RULES);
        assert_eq!(target.id, "987654");
        assert_eq!(target.reply_to_message_id.as_deref(), Some("msg_1"));
    }

    #[test]
    fn unknown_prefix_uses_default_kind() {
        let target = parse_target("party:3", &RULES);
        assert_eq!(target.kind, TargetKind::User);
        assert_eq!(target.id, "party");
        assert_eq!(target.reply_to_message_id.as_deref(), Some("3"));
    }

    #[test]
    fn parsing_is_total() {
        for raw in ["", ":", "::", "group:", "group::", ":::x", "a:b:c:d", "  ", "用户"] {
            let target = parse_target(raw, &RULES);
            assert!(!target.kind.as_str().is_empty());
            assert!(!target.id.contains(char::is_whitespace) || raw.trim().is_empty());
        }
        assert_eq!(parse_target("", &RULES).id, "");
        assert_eq!(parse_target("group:", &RULES).id, "");
        assert!(ensure_target(&parse_target("group:", &RULES)).is_err());
        assert!(ensure_target(&parse_target("group:1", &RULES)).is_ok());
    }

    #[test]
    fn unthreaded_rules_keep_colons_in_id() {
        let rules = TargetRules {
            threaded: false,
            ..RULES
        };
        let target = parse_target("user:a:b", &rules);
        assert_eq!(target.id, "a:b");
        assert!(target.reply_to_message_id.is_none());
    }
}
