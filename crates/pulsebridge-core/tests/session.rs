//! Session manager and uploader against a mocked ingestion endpoint.

use std::net::TcpListener;
use std::time::Duration;

use pulsebridge_core::{
    Credentials, EventUploader, InitializationEvent, SessionError, SessionManager, StreamConfig,
    TelemetrySample, UploadError,
};
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn credentials() -> Credentials {
    Credentials {
        login_id: "nordic".into(),
        password: "Samplepw1".into(),
        api_key: "ABCDEFG".into(),
        device_address: "AA:BB:CC:DD:EE:FF".into(),
    }
}

fn session(server: &MockServer, timeout: Duration) -> SessionManager {
    let mut session = SessionManager::new(Url::parse(&server.uri()).unwrap(), timeout).unwrap();
    session.set_credentials(credentials());
    session
}

fn login_ok() -> Mock {
    Mock::given(method("POST"))
        .and(path("/v2/login"))
        .and(body_json(json!({
            "login_id": "nordic",
            "password": "Samplepw1",
            "api_key": "ABCDEFG",
        })))
        .respond_with(ResponseTemplate::new(200))
}

#[tokio::test]
async fn accepted_event_needs_no_login() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/events/sensor_data/nordic"))
        .and(body_json(json!({ "event_data": { "heart_rate": 72 } })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    login_ok().expect(0).mount(&server).await;

    let mut session = session(&server, Duration::from_secs(5));
    session
        .post_event("sensor_data", &TelemetrySample::heart_rate(72), false)
        .await
        .unwrap();
}

#[tokio::test]
async fn rejected_event_logs_in_once_and_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/events/sensor_data/nordic"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/events/sensor_data/nordic"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    login_ok().expect(1).mount(&server).await;

    let mut session = session(&server, Duration::from_secs(5));
    session
        .post_event("sensor_data", &TelemetrySample::battery(88), false)
        .await
        .unwrap();
}

#[tokio::test]
async fn second_rejection_is_expired() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/events/sensor_data/nordic"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;
    login_ok().expect(1).mount(&server).await;

    let mut session = session(&server, Duration::from_secs(5));
    let err = session
        .post_event("sensor_data", &TelemetrySample::heart_rate(60), false)
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::Expired { status: 401 }));
    assert!(UploadError::classify(err).is_retryable());
}

async fn rejected_relogin_still_retries(login_status: u16) {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/events/sensor_data/nordic"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/login"))
        .respond_with(ResponseTemplate::new(login_status))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = session(&server, Duration::from_secs(5));
    let err = session
        .post_event("sensor_data", &TelemetrySample::heart_rate(61), false)
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::Expired { status: 401 }));
    assert!(UploadError::classify(err).is_retryable());
}

#[tokio::test]
async fn relogin_rejected_with_unauthorized_still_retries_the_event() {
    rejected_relogin_still_retries(401).await;
}

#[tokio::test]
async fn relogin_rate_limited_still_retries_the_event() {
    rejected_relogin_still_retries(429).await;
}

#[tokio::test]
async fn relogin_failure_does_not_block_a_successful_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/events/sensor_data/nordic"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/events/sensor_data/nordic"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/login"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = session(&server, Duration::from_secs(5));
    session
        .post_event("sensor_data", &TelemetrySample::battery(40), false)
        .await
        .unwrap();
}

#[tokio::test]
async fn rate_limited_login_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/login"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = session(&server, Duration::from_secs(5));
    let err = session.login().await.unwrap_err();

    assert!(matches!(err, SessionError::Unavailable { status: 429 }));
    assert!(UploadError::classify(err).is_retryable());
}

#[tokio::test]
async fn rejected_credentials_are_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/login"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = session(&server, Duration::from_secs(5));
    let err = session.login().await.unwrap_err();

    assert!(matches!(err, SessionError::Auth { status: 403 }));
    assert!(!UploadError::classify(err).is_retryable());
}

#[tokio::test]
async fn login_server_error_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/login"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut session = session(&server, Duration::from_secs(5));
    let err = session.login().await.unwrap_err();

    assert!(matches!(err, SessionError::Unavailable { status: 503 }));
    assert!(UploadError::classify(err).is_retryable());
}

#[tokio::test]
async fn slow_endpoint_times_out_as_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let mut session = session(&server, Duration::from_millis(100));
    let err = session
        .post_event("sensor_data", &TelemetrySample::heart_rate(72), false)
        .await
        .unwrap_err();

    assert!(err.is_connect_or_timeout());
    assert!(matches!(
        UploadError::classify(err),
        UploadError::RetryableTransport(SessionError::Transport(_))
    ));
}

#[tokio::test]
async fn refused_connection_is_retryable() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let endpoint = Url::parse(&format!("http://127.0.0.1:{port}")).unwrap();
    let mut session = SessionManager::new(endpoint, Duration::from_secs(2)).unwrap();
    session.set_credentials(credentials());

    let err = session
        .post_event("sensor_data", &TelemetrySample::heart_rate(72), false)
        .await
        .unwrap_err();

    assert!(err.is_connect_or_timeout());
    assert!(UploadError::classify(err).is_retryable());
}

#[tokio::test]
async fn session_cookie_is_reused_until_rebuild() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/events/sensor_data/nordic"))
        .and(header("cookie", "session=abc"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/events/sensor_data/nordic"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/login"))
        .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "session=abc; Path=/"))
        .expect(2)
        .mount(&server)
        .await;

    let mut session = session(&server, Duration::from_secs(5));
    let sample = TelemetrySample::heart_rate(72);

    session.post_event("sensor_data", &sample, false).await.unwrap();
    session.post_event("sensor_data", &sample, false).await.unwrap();

    session.rebuild().unwrap();
    session.post_event("sensor_data", &sample, false).await.unwrap();
}

#[tokio::test]
async fn relogin_uses_latest_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/events/sensor_data/rotated"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/events/sensor_data/rotated"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/login"))
        .and(body_json(json!({
            "login_id": "rotated",
            "password": "pw2",
            "api_key": "KEY2",
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = session(&server, Duration::from_secs(5));
    session.set_credentials(Credentials {
        login_id: "rotated".into(),
        password: "pw2".into(),
        api_key: "KEY2".into(),
        device_address: "11:22:33:44:55:66".into(),
    });

    session
        .post_event("sensor_data", &TelemetrySample::heart_rate(90), false)
        .await
        .unwrap();
}

#[tokio::test]
async fn uploader_skips_empty_samples() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut session = session(&server, Duration::from_secs(5));
    let uploader = EventUploader::new(StreamConfig::default());

    uploader
        .upload_telemetry(&mut session, &TelemetrySample::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn init_event_goes_to_device_stream_with_client_ip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/events/device_data/nordic"))
        .and(body_json(json!({
            "event_data": {
                "connected": true,
                "lan_ip_address": "192.168.1.20",
                "mac_address": 0xb827_eb11_2233_u64,
                "firmware_version": "032618a",
                "device_id": "AA:BB:CC:DD:EE:FF",
            },
            "add_client_ip": true,
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = session(&server, Duration::from_secs(5));
    let uploader = EventUploader::new(StreamConfig::default());
    let event = InitializationEvent {
        connected: true,
        local_network_address: Some("192.168.1.20".parse().unwrap()),
        hardware_identifier: Some(0xb827_eb11_2233),
        firmware_version: "032618a".into(),
        device_id: "AA:BB:CC:DD:EE:FF".into(),
    };

    uploader.upload_init(&mut session, &event).await.unwrap();
}
