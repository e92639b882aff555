//! Parser for the flat XML envelopes used by WeCom callbacks.
//!
//! Vendor bodies are not always well-formed XML (stray text, unescaped `&`
//! inside CDATA, missing prolog), so this is a tolerant tag scanner rather
//! than a full XML reader. Nested elements are flattened: every leaf tag is
//! reachable by its local name, first occurrence wins.

use crate::channels::error::{ChannelError, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::error;

const CDATA_OPEN: &str = "<![CDATA[";
const CDATA_CLOSE: &str = "]]>";
/// Callback envelopes nest two or three levels; anything deeper is rejected.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub root: String,
    fields: HashMap<String, String>,
}

impl Envelope {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// Looks up the first present name, for tags that vendors spell inconsistently.
    pub fn get_any(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|name| self.get(name))
    }

    pub fn fields(&self) -> &HashMap<String, String> {
        &self.fields
    }
}

fn open_tag_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| match Regex::new(r"<([A-Za-z_][A-Za-z0-9_.\-]*)(\s[^<>]*?)?(/?)>") {
        Ok(regex) => Some(regex),
        Err(err) => {
            error!("envelope tag regex compile failed: {err}");
            None
        }
    })
    .as_ref()
}

pub fn parse_envelope(raw: &str) -> Result<Envelope> {
    let regex = open_tag_regex()
        .ok_or_else(|| ChannelError::invalid_payload("xml scanner unavailable"))?;
    let captures = regex
        .captures(raw)
        .ok_or_else(|| ChannelError::invalid_payload("xml envelope has no root element"))?;
    let root = captures[1].to_string();
    let mut envelope = Envelope {
        root: root.clone(),
        fields: HashMap::new(),
    };
    let Some(whole) = captures.get(0) else {
        return Ok(envelope);
    };
    if captures.get(3).is_some_and(|slash| !slash.as_str().is_empty()) {
        return Ok(envelope);
    }
    let after = &raw[whole.end()..];
    let body = match after.rfind(&format!("</{root}>")) {
        Some(end) => &after[..end],
        None => after,
    };
    collect_fields(regex, body, 1, &mut envelope.fields)?;
    Ok(envelope)
}

fn collect_fields(
    regex: &Regex,
    body: &str,
    depth: usize,
    out: &mut HashMap<String, String>,
) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(ChannelError::invalid_payload("xml envelope nested too deeply"));
    }
    let mut rest = body;
    while let Some(captures) = regex.captures(rest) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            break;
        };
        let name = name.as_str();
        let after = &rest[whole.end()..];
        if captures.get(3).is_some_and(|slash| !slash.as_str().is_empty()) {
            out.entry(name.to_string()).or_default();
            rest = after;
            continue;
        }
        let close = format!("</{name}>");
        let trimmed = after.trim_start();
        if let Some(cdata) = trimmed.strip_prefix(CDATA_OPEN) {
            let Some(cdata_end) = cdata.find(CDATA_CLOSE) else {
                break;
            };
            out.entry(name.to_string())
                .or_insert_with(|| cdata[..cdata_end].to_string());
            let tail = &cdata[cdata_end + CDATA_CLOSE.len()..];
            rest = match tail.find(&close) {
                Some(end) => &tail[end + close.len()..],
                None => tail,
            };
            continue;
        }
        let Some(end) = after.find(&close) else {
            rest = after;
            continue;
        };
        let inner = &after[..end];
        if regex.is_match(inner) {
            collect_fields(regex, inner, depth + 1, out)?;
        } else {
            out.entry(name.to_string())
                .or_insert_with(|| unescape(inner.trim()));
        }
        rest = &after[end + close.len()..];
    }
    Ok(())
}

fn unescape(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[derive(Debug, Clone, Copy)]
pub enum XmlField<'a> {
    Text(&'a str, &'a str),
    Cdata(&'a str, &'a str),
}

/// Renders a flat `<xml>` envelope for passive replies.
pub fn render_envelope(fields: &[XmlField<'_>]) -> String {
    let mut output = String::from("<xml>");
    for field in fields {
        match field {
            XmlField::Text(name, value) => {
                output.push_str(&format!("<{name}>{value}</{name}>"));
            }
            XmlField::Cdata(name, value) => {
                let value = value.replace(CDATA_CLOSE, "]]]]><![CDATA[>");
                output.push_str(&format!("<{name}><![CDATA[{value}]]></{name}>"));
            }
        }
    }
    output.push_str("</xml>");
    output
}
