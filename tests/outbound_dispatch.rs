use imgate::channels::types::{OutboundPayload, TextFormat};
use imgate::channels::{build_default_registry, ChannelService, TokenCache};
use imgate::config::Config;
use imgate::config_store::ConfigStore;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn service(config: Config) -> ChannelService {
    ChannelService::new(
        ConfigStore::from_config(config),
        build_default_registry(),
        TokenCache::new(),
        reqwest::Client::new(),
    )
}

fn onebot_config(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.channels.onebot.enabled = true;
    config.channels.onebot.base.http_url = server.uri();
    config.channels.onebot.base.access_token = "ob-token".to_string();
    config
}

#[tokio::test]
async fn onebot_group_send_uses_numeric_group_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/send_group_msg"))
        .and(header("authorization", "Bearer ob-token"))
        .and(body_partial_json(json!({
            "group_id": 987654,
            "message": [{ "type": "text", "data": { "text": "hello" } }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "ok",
            "retcode": 0,
            "data": { "message_id": 42 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = service(onebot_config(&server))
        .send_text("onebot", None, "group:987654", "hello")
        .await
        .unwrap();
    assert_eq!(result.channel, "onebot");
    assert_eq!(result.chat_id, "group:987654");
    assert_eq!(result.message_id, "onebot:42");
}

#[tokio::test]
async fn onebot_nonzero_retcode_is_a_vendor_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/send_private_msg"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "failed",
            "retcode": 100,
            "wording": "user not found"
        })))
        .mount(&server)
        .await;

    let err = service(onebot_config(&server))
        .send_text("qq", None, "10001", "hello")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VENDOR_API_ERROR");
    assert!(err.to_string().contains("user not found"));
}

fn wecom_config(server: &MockServer) -> Config {
    let mut config = Config::default();
    let wecom = &mut config.channels.wecom;
    wecom.enabled = true;
    wecom.base.corp_id = "wwcorp".to_string();
    wecom.base.agent_id = "1000002".to_string();
    wecom.base.secret = "wecom-secret".to_string();
    wecom.base.api_base = server.uri();
    config
}

#[tokio::test]
async fn wecom_concurrent_sends_share_one_token_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cgi-bin/gettoken"))
        .and(query_param("corpid", "wwcorp"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "errcode": 0, "access_token": "T1", "expires_in": 7200 }))
                .set_delay(std::time::Duration::from_millis(50)),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/cgi-bin/message/send"))
        .and(query_param("access_token", "T1"))
        .and(body_partial_json(json!({ "agentid": 1000002, "msgtype": "text" })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "errcode": 0, "msgid": "m1" })),
        )
        .expect(8)
        .mount(&server)
        .await;

    let service = service(wecom_config(&server));
    let sends = (0..8).map(|index| {
        let service = service.clone();
        async move {
            service
                .send_text("wecom", None, &format!("user:u{index}"), "hello")
                .await
        }
    });
    let results = futures::future::join_all(sends).await;
    for result in results {
        assert_eq!(result.unwrap().message_id, "wecom:m1");
    }
    assert_eq!(service.tokens().len(), 1);
}

#[tokio::test]
async fn wecom_rejected_token_is_refetched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cgi-bin/gettoken"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "errcode": 0, "access_token": "T1", "expires_in": 7200 })),
        )
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/cgi-bin/appchat/send"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 42001,
            "errmsg": "access_token expired"
        })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/cgi-bin/appchat/send"))
        .and(body_partial_json(json!({ "chatid": "CHAT1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "errcode": 0 })))
        .mount(&server)
        .await;

    let service = service(wecom_config(&server));
    let err = service
        .send_text("wecom", None, "group:CHAT1", "hello")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VENDOR_API_ERROR");
    let result = service
        .send_text("wecom", None, "group:CHAT1", "hello")
        .await
        .unwrap();
    assert_eq!(result.chat_id, "group:CHAT1");
}

#[tokio::test]
async fn wecom_token_failure_is_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cgi-bin/gettoken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 40001,
            "errmsg": "invalid credential"
        })))
        .expect(2)
        .mount(&server)
        .await;

    let service = service(wecom_config(&server));
    for _ in 0..2 {
        let err = service
            .send_text("wecom", None, "zhangsan", "hello")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VENDOR_API_ERROR");
    }
    assert!(service.tokens().is_empty());
}

#[tokio::test]
async fn feishu_chat_send_and_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/open-apis/auth/v3/tenant_access_token/internal"))
        .and(body_partial_json(json!({ "app_id": "cli_a1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "msg": "ok",
            "tenant_access_token": "t-abc",
            "expire": 7200
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/open-apis/im/v1/messages"))
        .and(query_param("receive_id_type", "chat_id"))
        .and(header("authorization", "Bearer t-abc"))
        .and(body_partial_json(json!({ "receive_id": "oc_abc", "msg_type": "text" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "data": { "message_id": "om_1" }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/open-apis/im/v1/messages/om_1/reply"))
        .and(body_partial_json(json!({ "msg_type": "post" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "data": { "message_id": "om_2" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = Config::default();
    config.channels.feishu.enabled = true;
    config.channels.feishu.base.app_id = "cli_a1".to_string();
    config.channels.feishu.base.app_secret = "secret".to_string();
    config.channels.feishu.base.domain = server.uri();
    let service = service(config);

    let result = service
        .send_text("lark", None, "oc_abc", "hello")
        .await
        .unwrap();
    assert_eq!(result.chat_id, "group:oc_abc");
    assert_eq!(result.message_id, "feishu:om_1");

    let payload = OutboundPayload {
        text: Some("done".to_string()),
        format: TextFormat::Markdown,
        ..OutboundPayload::default()
    };
    let result = service
        .send_payload("feishu", None, "chat:oc_abc:om_1", &payload)
        .await
        .unwrap();
    assert_eq!(result.message_id, "feishu:om_2");
}

#[tokio::test]
async fn qqbot_group_send_accepts_string_expiry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/app/getAppAccessToken"))
        .and(body_partial_json(json!({ "appId": "102000001" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "qq-token",
            "expires_in": "7200"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/groups/G1/messages"))
        .and(header("authorization", "QQBot qq-token"))
        .and(body_partial_json(json!({ "msg_type": 0, "content": "hello", "msg_id": "M0" })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "qq-1", "timestamp": 1 })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut config = Config::default();
    let qqbot = &mut config.channels.qqbot;
    qqbot.enabled = true;
    qqbot.base.app_id = "102000001".to_string();
    qqbot.base.client_secret = "secret".to_string();
    qqbot.base.api_base = server.uri();
    qqbot.base.token_url = format!("{}/app/getAppAccessToken", server.uri());

    let result = service(config)
        .send_text("qq-official", None, "group:G1:M0", "hello")
        .await
        .unwrap();
    assert_eq!(result.chat_id, "group:G1");
    assert_eq!(result.message_id, "qqbot:qq-1");
}

#[tokio::test]
async fn dingtalk_group_send_with_named_account() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1.0/oauth2/accessToken"))
        .and(body_partial_json(json!({ "appKey": "ding-sales" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "accessToken": "d-token", "expireIn": 7200 })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1.0/robot/groupMessages/send"))
        .and(header("x-acs-dingtalk-access-token", "d-token"))
        .and(body_partial_json(json!({
            "robotCode": "ding-sales",
            "openConversationId": "cid123",
            "msgKey": "sampleText"
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "processQueryKey": "pqk" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let yaml = format!(
        "channels:\n  dingtalk:\n    accounts:\n      Sales:\n        appKey: ding-sales\n        appSecret: s\n        apiBase: {}\n",
        server.uri()
    );
    let config: Config = serde_yaml::from_str(&yaml).unwrap();
    let result = service(config)
        .send_text("dingding", Some("sales"), "group:cid123", "hello")
        .await
        .unwrap();
    assert_eq!(result.chat_id, "group:cid123");
    assert_eq!(result.message_id, "dingtalk:pqk");
}

#[tokio::test]
async fn unconfigured_account_fails_before_any_request() {
    let server = MockServer::start().await;
    let mut config = wecom_config(&server);
    config.channels.wecom.base.secret.clear();
    let err = service(config)
        .send_text("wecom", None, "zhangsan", "hello")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFIGURATION_ERROR");
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn dingtalk_blank_media_without_text_is_rejected() {
    let server = MockServer::start().await;
    let mut config = Config::default();
    let dingtalk = &mut config.channels.dingtalk;
    dingtalk.enabled = true;
    dingtalk.base.app_key = "ding-key".to_string();
    dingtalk.base.app_secret = "ding-secret".to_string();
    dingtalk.base.api_base = server.uri();
    let payload = OutboundPayload {
        media_url: Some("   ".to_string()),
        ..OutboundPayload::default()
    };
    let err = service(config)
        .send_payload("dingtalk", None, "group:cid123", &payload)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_PAYLOAD");
    assert!(server.received_requests().await.unwrap().is_empty());
}
