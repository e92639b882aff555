use crate::channels::error::{ChannelError, Result};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;

const ERROR_BODY_LIMIT: usize = 512;
const MEDIA_MAX_BYTES: usize = 20 * 1024 * 1024;

pub struct MediaFile {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub content_type: String,
}

/// Sends a request and returns the decoded JSON body; non-2xx statuses become `VendorApi`.
pub async fn send_json(platform: &str, request: RequestBuilder) -> Result<Value> {
    let response = request
        .send()
        .await
        .map_err(|err| ChannelError::transport(platform, err))?;
    read_json(platform, response).await
}

pub async fn read_json(platform: &str, response: Response) -> Result<Value> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| ChannelError::transport(platform, err))?;
    if !status.is_success() {
        let detail = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|body| vendor_message(&body))
            .unwrap_or_else(|| truncate(&text));
        return Err(ChannelError::vendor(
            platform,
            i64::from(status.as_u16()),
            detail,
        ));
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|_| {
        ChannelError::vendor(
            platform,
            i64::from(status.as_u16()),
            format!("response is not json: {}", truncate(&text)),
        )
    })
}

/// Fails when `code_field` is present and non-zero.
pub fn check_code(platform: &str, body: &Value, code_field: &str) -> Result<()> {
    let code = match body.get(code_field) {
        None | Some(Value::Null) => return Ok(()),
        Some(value) => value
            .as_i64()
            .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
            .unwrap_or(-1),
    };
    if code == 0 {
        return Ok(());
    }
    let message = vendor_message(body).unwrap_or_else(|| "unknown".to_string());
    Err(ChannelError::vendor(platform, code, message))
}

fn vendor_message(body: &Value) -> Option<String> {
    ["errmsg", "msg", "message", "wording", "error"]
        .iter()
        .find_map(|field| body.get(*field).and_then(Value::as_str))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn truncate(text: &str) -> String {
    let text = text.trim();
    if text.len() <= ERROR_BODY_LIMIT {
        return text.to_string();
    }
    let mut end = ERROR_BODY_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

pub fn str_field<'a>(body: &'a Value, field: &str) -> Option<&'a str> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Renders ids that vendors send either as JSON numbers or strings.
pub fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text.trim().to_string()).filter(|value| !value.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// `expires_in` arrives as a number on most platforms and as a string on QQ.
pub fn expires_in(value: Option<&Value>, fallback: u64) -> u64 {
    match value {
        Some(Value::Number(number)) => number.as_u64().unwrap_or(fallback),
        Some(Value::String(text)) => text.trim().parse().unwrap_or(fallback),
        _ => fallback,
    }
}

pub fn resolve_base_url(configured: &str, default_host: &str) -> String {
    let domain = Some(configured.trim())
        .filter(|value| !value.is_empty())
        .unwrap_or(default_host);
    if domain.starts_with("http://") || domain.starts_with("https://") {
        domain.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", domain.trim_end_matches('/'))
    }
}

/// Shallow-merges vendor-native fields over a generated request body.
pub fn merge_channel_data(body: &mut Value, channel_data: Option<&Value>) {
    let (Some(target), Some(Value::Object(extra))) = (body.as_object_mut(), channel_data) else {
        return;
    };
    for (key, value) in extra {
        target.insert(key.clone(), value.clone());
    }
}

pub async fn download_media(http: &Client, platform: &str, url: &str) -> Result<MediaFile> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ChannelError::invalid_payload("media url is empty"));
    }
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|err| ChannelError::transport(platform, err))?;
    let status = response.status();
    if !status.is_success() {
        return Err(ChannelError::transport(
            platform,
            format!("media download failed: {status}"),
        ));
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let bytes = response
        .bytes()
        .await
        .map_err(|err| ChannelError::transport(platform, err))?;
    if bytes.len() > MEDIA_MAX_BYTES {
        return Err(ChannelError::invalid_payload(format!(
            "media exceeds {MEDIA_MAX_BYTES} bytes"
        )));
    }
    Ok(MediaFile {
        bytes: bytes.to_vec(),
        file_name: file_name_from_url(url),
        content_type,
    })
}

fn file_name_from_url(raw: &str) -> String {
    url::Url::parse(raw)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "media.bin".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn check_code_reads_numeric_and_string_codes() {
        assert!(check_code("wecom", &json!({ "errcode": 0 }), "errcode").is_ok());
        assert!(check_code("wecom", &json!({}), "errcode").is_ok());
        let err = check_code(
            "wecom",
            &json!({ "errcode": 40014, "errmsg": "invalid access_token" }),
            "errcode",
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "wecom api error 40014: invalid access_token");
        let err = check_code("onebot", &json!({ "retcode": "100", "wording": "bad" }), "retcode")
            .unwrap_err();
        assert!(matches!(err, ChannelError::VendorApi { code: 100, .. }));
    }

    #[test]
    fn ids_and_ttl_accept_numbers_and_strings() {
        assert_eq!(id_string(Some(&json!(123))).as_deref(), Some("123"));
        assert_eq!(id_string(Some(&json!(" ab "))).as_deref(), Some("ab"));
        assert_eq!(id_string(Some(&json!(null))), None);
        assert_eq!(expires_in(Some(&json!("7200")), 1), 7200);
        assert_eq!(expires_in(Some(&json!(60)), 1), 60);
        assert_eq!(expires_in(None, 1), 1);
    }

    #[test]
    fn base_url_and_file_names() {
        assert_eq!(resolve_base_url("", "qyapi.weixin.qq.com"), "https://qyapi.weixin.qq.com");
        assert_eq!(resolve_base_url("http://127.0.0.1:9/", "x"), "http://127.0.0.1:9");
        assert_eq!(file_name_from_url("https://a.com/p/cat.png?x=1"), "cat.png");
        assert_eq!(file_name_from_url("not a url"), "media.bin");
    }

    #[test]
    fn channel_data_overrides_generated_fields() {
        let mut body = json!({ "msgtype": "text", "safe": 0 });
        merge_channel_data(&mut body, Some(&json!({ "safe": 1, "enable_id_trans": 1 })));
        assert_eq!(body["safe"], 1);
        assert_eq!(body["enable_id_trans"], 1);
        merge_channel_data(&mut body, None);
        assert_eq!(body["msgtype"], "text");
    }
}
