//! Integration tests using wiremock to simulate the platform.

use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wecom_dispatch::{
    AgentCredential, Client, Context, Error, ErrorKind, Hook, Phase, RequestBuilder,
    RetryStrategy,
};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN_PATH: &str = "/cgi-bin/gettoken";
const USER_PATH: &str = "/cgi-bin/user/get";

#[derive(Debug, Deserialize, PartialEq)]
struct User {
    userid: String,
    name: String,
}

fn token_body(token: &str, expires_in: i64) -> serde_json::Value {
    json!({"errcode": 0, "errmsg": "ok", "access_token": token, "expires_in": expires_in})
}

fn user_body() -> serde_json::Value {
    json!({"errcode": 0, "errmsg": "ok", "userid": "zhangsan", "name": "Zhang San"})
}

async fn mount_token(server: &MockServer, token: &str, expected: u64) {
    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body(token, 7200)))
        .expect(expected)
        .mount(server)
        .await;
}

fn single_agent_client(server: &MockServer) -> Client {
    Client::builder()
        .base_url(server.uri())
        .unwrap()
        .corp_id("c1")
        .agent(AgentCredential::new(100, "s1", "main"))
        .build()
        .unwrap()
}

fn get_user() -> RequestBuilder {
    RequestBuilder::new(http::Method::GET, USER_PATH).query("userid", "zhangsan")
}

#[tokio::test]
async fn test_token_reused_within_ttl() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .and(query_param("corpid", "c1"))
        .and(query_param("corpsecret", "s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T1", 7200)))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .and(query_param("access_token", "T1"))
        .and(query_param("userid", "zhangsan"))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_body()))
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = single_agent_client(&mock_server);
    let ctx = Context::new();

    let first = client
        .call::<(), User>(&ctx, &get_user(), None)
        .await
        .unwrap();
    assert_eq!(first.data.userid, "zhangsan");
    assert_eq!(first.attempts, 1);
    assert!(!first.was_retried());
    assert!(!first.token_refreshed);

    let second = client
        .call::<(), User>(&ctx, &get_user(), None)
        .await
        .unwrap();
    assert_eq!(second.data.name, "Zhang San");
    assert_eq!(client.token_cache().fetch_count(), 1);
}

#[tokio::test]
async fn test_token_expired_errcode_refreshes_once() {
    let mock_server = MockServer::start().await;
    let token_fetches = Arc::new(AtomicUsize::new(0));
    let business_calls = Arc::new(AtomicUsize::new(0));

    let fetches = token_fetches.clone();
    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .respond_with(move |_req: &wiremock::Request| {
            let n = fetches.fetch_add(1, Ordering::SeqCst) + 1;
            ResponseTemplate::new(200).set_body_json(token_body(&format!("T{n}"), 7200))
        })
        .expect(2)
        .mount(&mock_server)
        .await;

    let calls = business_calls.clone();
    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .respond_with(move |_req: &wiremock::Request| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(200)
                    .set_body_json(json!({"errcode": 42001, "errmsg": "access_token expired"}))
            } else {
                ResponseTemplate::new(200).set_body_json(user_body())
            }
        })
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = single_agent_client(&mock_server);
    let response = client
        .call::<(), User>(&Context::new(), &get_user(), None)
        .await
        .unwrap();

    assert_eq!(response.data.userid, "zhangsan");
    assert!(response.token_refreshed);
    assert_eq!(response.attempts, 2);
    assert_eq!(token_fetches.load(Ordering::SeqCst), 2);
    assert_eq!(business_calls.load(Ordering::SeqCst), 2);

    let requests = mock_server.received_requests().await.unwrap();
    let tokens_sent: Vec<String> = requests
        .iter()
        .filter(|r| r.url.path() == USER_PATH)
        .filter_map(|r| {
            r.url
                .query_pairs()
                .find(|(k, _)| k == "access_token")
                .map(|(_, v)| v.into_owned())
        })
        .collect();
    assert_eq!(tokens_sent, vec!["T1", "T2"]);
}

#[tokio::test]
async fn test_second_token_rejection_is_final() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, "T1", 2).await;

    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"errcode": 40014, "errmsg": "invalid access_token"})),
        )
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = single_agent_client(&mock_server);
    let result = client
        .execute::<()>(&Context::new(), &get_user(), None)
        .await;

    match result {
        Err(Error::Token { errcode, errmsg }) => {
            assert_eq!(errcode, 40014);
            assert_eq!(errmsg, "invalid access_token");
        }
        other => panic!("Expected Token error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_custom_token_invalid_codes() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, "T1", 1).await;

    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"errcode": 42001, "errmsg": "access_token expired"})),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    // 42001 is no longer treated as a token error, so it is an API error.
    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .corp_id("c1")
        .default_secret("s1")
        .token_invalid_codes([40014])
        .build()
        .unwrap();

    let err = client
        .execute::<()>(&Context::new(), &get_user(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Api);
    assert_eq!(err.errcode(), Some(42001));
}

#[tokio::test]
async fn test_agent_selected_by_name_uses_its_token() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .and(query_param("corpsecret", "s-customer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T-customer", 7200)))
        .expect(0)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .and(query_param("corpsecret", "s-study"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("T-study", 7200)))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .and(query_param("access_token", "T-study"))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_body()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .corp_id("c1")
        .agent(AgentCredential::new(100001, "s-customer", "customer"))
        .agent(AgentCredential::new(100002, "s-study", "study"))
        .build()
        .unwrap();

    let ctx = Context::new().with_agent_name("study");
    client
        .call::<(), User>(&ctx, &get_user(), None)
        .await
        .unwrap();

    let study = client
        .config()
        .resolve(&ctx)
        .unwrap();
    assert_eq!(study.agent_id(), Some(100002));
    assert_eq!(
        client
            .token_cache()
            .cached(study.key())
            .map(|t| t.value().to_string()),
        Some("T-study".to_string())
    );

    let customer = client
        .config()
        .resolve(&Context::new().with_agent_id(100001))
        .unwrap();
    assert!(client.token_cache().cached(customer.key()).is_none());
}

#[tokio::test]
async fn test_unknown_agent_sends_nothing() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, "T1", 0).await;

    let client = single_agent_client(&mock_server);
    let result = client
        .execute::<()>(&Context::new().with_agent_name("sales"), &get_user(), None)
        .await;

    assert!(matches!(result, Err(Error::Configuration(_))));
    assert!(mock_server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_api_error_is_not_retried() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, "T1", 1).await;

    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"errcode": 60111, "errmsg": "userid not found"})),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .corp_id("c1")
        .default_secret("s1")
        .retry_count(3)
        .build()
        .unwrap();

    match client
        .execute::<()>(&Context::new(), &get_user(), None)
        .await
    {
        Err(Error::Api {
            errcode,
            errmsg,
            raw_response,
        }) => {
            assert_eq!(errcode, 60111);
            assert_eq!(errmsg, "userid not found");
            assert!(String::from_utf8_lossy(&raw_response).contains("60111"));
        }
        other => panic!("Expected Api error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_retry_on_5xx() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, "T1", 1).await;
    let attempt_count = Arc::new(AtomicUsize::new(0));
    let attempt_count_clone = attempt_count.clone();

    // First two requests fail with 500, third succeeds
    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .respond_with(move |_req: &wiremock::Request| {
            let count = attempt_count_clone.fetch_add(1, Ordering::SeqCst);
            if count < 2 {
                ResponseTemplate::new(500).set_body_string("Server error")
            } else {
                ResponseTemplate::new(200).set_body_json(user_body())
            }
        })
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .corp_id("c1")
        .default_secret("s1")
        .retry_strategy(RetryStrategy::Linear {
            delay: Duration::from_millis(10),
            max_retries: 3,
        })
        .build()
        .unwrap();

    let response = client
        .call::<(), User>(&Context::new(), &get_user(), None)
        .await
        .unwrap();

    assert_eq!(response.data.userid, "zhangsan");
    assert_eq!(response.attempts, 3);
    assert!(response.was_retried());
    assert!(!response.token_refreshed);
    assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_max_retries_exceeded() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, "T1", 1).await;

    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("Unavailable"))
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .corp_id("c1")
        .default_secret("s1")
        .retry_strategy(RetryStrategy::Linear {
            delay: Duration::from_millis(10),
            max_retries: 2,
        })
        .build()
        .unwrap();

    let result = client
        .execute::<()>(&Context::new(), &get_user(), None)
        .await;

    match result {
        Err(Error::MaxRetriesExceeded {
            attempts,
            last_error,
        }) => {
            // max_retries: 2 means 3 total attempts (1 initial + 2 retries)
            assert_eq!(attempts, 3);
            assert_eq!(last_error.status().map(|s| s.as_u16()), Some(503));
        }
        other => panic!("Expected MaxRetriesExceeded, got {:?}", other),
    }
}

#[tokio::test]
async fn test_no_retry_by_default() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, "T1", 1).await;

    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("Server error"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = single_agent_client(&mock_server);
    let result = client
        .execute::<()>(&Context::new(), &get_user(), None)
        .await;

    match result {
        Err(Error::Http {
            status,
            raw_response,
            ..
        }) => {
            assert_eq!(status.as_u16(), 500);
            assert_eq!(raw_response, "Server error");
        }
        other => panic!("Expected Http error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_token_endpoint_error_skips_business_call() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"errcode": 40001, "errmsg": "invalid credential"})),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_body()))
        .expect(0)
        .mount(&mock_server)
        .await;

    let client = single_agent_client(&mock_server);
    let err = client
        .execute::<()>(&Context::new(), &get_user(), None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Token);
    assert_eq!(err.errcode(), Some(40001));
    assert_eq!(err.errmsg(), Some("invalid credential"));
}

#[tokio::test]
async fn test_cancelled_before_execution_sends_nothing() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, "T1", 0).await;

    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_body()))
        .expect(0)
        .mount(&mock_server)
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let client = single_agent_client(&mock_server);
    let err = client
        .execute::<()>(&Context::new().with_cancellation(cancel), &get_user(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(err.kind(), ErrorKind::Cancellation);
    assert!(mock_server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancelled_by_hook_before_send() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, "T1", 1).await;

    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_body()))
        .expect(0)
        .mount(&mock_server)
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .corp_id("c1")
        .default_secret("s1")
        .hook(Hook::before_request(move |_ctx, _req| {
            trigger.cancel();
            Ok(())
        }))
        .build()
        .unwrap();

    let err = client
        .execute::<()>(&Context::new().with_cancellation(cancel), &get_user(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn test_deadline_during_execution() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, "T1", 1).await;

    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(user_body())
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .corp_id("c1")
        .default_secret("s1")
        .retry_count(3)
        .build()
        .unwrap();

    let ctx = Context::new().with_timeout(Duration::from_millis(200));
    let err = client
        .execute::<()>(&ctx, &get_user(), None)
        .await
        .unwrap_err();

    // Cancellation is never treated as a retryable transport failure.
    assert!(matches!(err, Error::DeadlineExceeded));
    assert!(!err.is_retryable());
    assert_eq!(
        mock_server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == USER_PATH)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_hooks_run_in_order_per_phase() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, "T1", 1).await;

    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .and(header("x-hook", "A>B>C"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(user_body())
                .insert_header("x-served-by", "mock"),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut builder = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .corp_id("c1")
        .default_secret("s1");

    for name in ["A", "B", "C"] {
        let l = log.clone();
        builder = builder.hook(Hook::before_request(move |_ctx, req: &mut reqwest::Request| {
            assert!(req.url().query().unwrap_or_default().contains("access_token=T1"));
            let value = match req.headers().get("x-hook") {
                Some(prev) => format!("{}>{}", prev.to_str()?, name),
                None => name.to_string(),
            };
            req.headers_mut().insert("x-hook", value.parse::<http::HeaderValue>()?);
            l.lock().unwrap().push(format!("before:{name}"));
            Ok(())
        }));
        let l = log.clone();
        builder = builder.hook(Hook::raw_response(move |_ctx, raw| {
            assert_eq!(raw.header("x-served-by"), Some("mock"));
            l.lock().unwrap().push(format!("raw:{name}"));
            Ok(())
        }));
        let l = log.clone();
        builder = builder.hook(Hook::after_decode(move |_ctx, envelope| {
            assert!(envelope.is_success());
            l.lock().unwrap().push(format!("after:{name}"));
            Ok(())
        }));
    }

    let client = builder.build().unwrap();
    client
        .execute::<()>(&Context::new(), &get_user(), None)
        .await
        .unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "before:A", "before:B", "before:C", "raw:A", "raw:B", "raw:C", "after:A", "after:B",
            "after:C",
        ]
    );
}

#[tokio::test]
async fn test_failing_before_hook_prevents_request() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, "T1", 1).await;

    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_body()))
        .expect(0)
        .mount(&mock_server)
        .await;

    let ran_c = Arc::new(AtomicUsize::new(0));
    let ran = ran_c.clone();
    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .corp_id("c1")
        .default_secret("s1")
        .hook(Hook::before_request(|_ctx, _req| Ok(())))
        .hook(Hook::before_request(|_ctx, _req| Err("rate limited".into())))
        .hook(Hook::before_request(move |_ctx, _req| {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .build()
        .unwrap();

    let err = client
        .execute::<()>(&Context::new(), &get_user(), None)
        .await
        .unwrap_err();

    match &err {
        Error::Interceptor { phase, index, .. } => {
            assert_eq!(*phase, Phase::BeforeRequest);
            assert_eq!(*index, 1);
        }
        other => panic!("Expected Interceptor error, got {:?}", other),
    }
    assert_eq!(ran_c.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_raw_response_hook_failure_aborts() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, "T1", 1).await;

    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_body()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .corp_id("c1")
        .default_secret("s1")
        .hook(Hook::raw_response(|_ctx, _raw| Err("unexpected content type".into())))
        .build()
        .unwrap();

    let err = client
        .execute::<()>(&Context::new(), &get_user(), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Interceptor {
            phase: Phase::RawResponse,
            index: 0,
            ..
        }
    ));
}

#[tokio::test]
async fn test_after_decode_hook_error_is_surfaced_without_retry() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, "T1", 1).await;

    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_body()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .corp_id("c1")
        .default_secret("s1")
        .retry_count(2)
        .hook(Hook::after_decode(|_ctx, _envelope| Err("metrics sink down".into())))
        .build()
        .unwrap();

    let err = client
        .execute::<()>(&Context::new(), &get_user(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Interceptor);
    assert!(err.to_string().contains("metrics sink down"));
}

#[tokio::test]
async fn test_after_decode_hook_sees_api_errors_but_api_error_wins() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, "T1", 1).await;

    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"errcode": 60111, "errmsg": "userid not found"})),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .corp_id("c1")
        .default_secret("s1")
        .hook(Hook::after_decode(move |_ctx, envelope| {
            s.lock().unwrap().push(envelope.errcode);
            Err("audit log full".into())
        }))
        .build()
        .unwrap();

    let err = client
        .execute::<()>(&Context::new(), &get_user(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Api);
    assert_eq!(err.errcode(), Some(60111));
    assert_eq!(*seen.lock().unwrap(), vec![60111]);
}

#[tokio::test]
async fn test_expired_token_is_refetched() {
    let mock_server = MockServer::start().await;
    let fetches = Arc::new(AtomicUsize::new(0));

    let f = fetches.clone();
    Mock::given(method("GET"))
        .and(path(TOKEN_PATH))
        .respond_with(move |_req: &wiremock::Request| {
            let n = f.fetch_add(1, Ordering::SeqCst) + 1;
            ResponseTemplate::new(200).set_body_json(token_body(&format!("T{n}"), 1))
        })
        .expect(2)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_body()))
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = single_agent_client(&mock_server);
    let ctx = Context::new();

    client.execute::<()>(&ctx, &get_user(), None).await.unwrap();
    // A 1s token with the margin capped at 500ms is stale after 600ms.
    tokio::time::sleep(Duration::from_millis(600)).await;
    client.execute::<()>(&ctx, &get_user(), None).await.unwrap();

    let requests = mock_server.received_requests().await.unwrap();
    let last_business = requests
        .iter()
        .filter(|r| r.url.path() == USER_PATH)
        .last()
        .unwrap();
    assert!(last_business
        .url
        .query_pairs()
        .any(|(k, v)| k == "access_token" && v == "T2"));
}

#[tokio::test]
async fn test_trace_id_header_sent() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, "T1", 1).await;

    Mock::given(method("POST"))
        .and(path("/cgi-bin/message/send"))
        .and(header("x-trace-id", "trace-9"))
        .and(header("content-type", "application/json"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"errcode": 0, "errmsg": "ok", "msgid": "m1"})),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .corp_id("c1")
        .default_secret("s1")
        .debug(true)
        .build()
        .unwrap();

    let ctx = Context::new().with_trace_id("trace-9");
    let response = client
        .post::<_, serde_json::Value>(
            &ctx,
            "/cgi-bin/message/send",
            &json!({"touser": "@all", "msgtype": "text"}),
        )
        .await
        .unwrap();
    assert_eq!(response.data["msgid"], "m1");
}

#[tokio::test]
async fn test_undecodable_envelope() {
    let mock_server = MockServer::start().await;
    mount_token(&mock_server, "T1", 1).await;

    Mock::given(method("GET"))
        .and(path(USER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&mock_server)
        .await;

    let client = single_agent_client(&mock_server);
    let err = client
        .get::<User>(&Context::new(), USER_PATH)
        .await
        .unwrap_err();

    match err {
        Error::Deserialization {
            raw_response,
            status,
            ..
        } => {
            assert_eq!(status.as_u16(), 200);
            assert_eq!(raw_response, "<html>maintenance</html>");
        }
        other => panic!("Expected Deserialization error, got {:?}", other),
    }
}
