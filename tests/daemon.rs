use std::io::Write;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tsidd::config::ConfigError;
use tsidd::{daemon, DaemonConfig};

async fn get(addr: std::net::SocketAddr, path: &str) -> (u16, serde_json::Value) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    let code = response[9..12].parse().unwrap();
    let (_, body) = response.split_once("\r\n\r\n").unwrap();
    (code, serde_json::from_str(body).unwrap_or(serde_json::Value::Null))
}

fn config_file(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn test_health_reports_leased_node() {
    let file = config_file(
        r#"
        [store]
        endpoint = "memory://"

        [lease]
        key_prefix = "it:node:"
        max_node = 8
        "#,
    );
    let config = DaemonConfig::load(Some(file.path())).unwrap();
    let node = daemon::bootstrap(&config).await.unwrap();
    assert_eq!(node.assignment.lease_key.as_deref(), Some("it:node:0"));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(daemon::serve(node, listener, shutdown.clone()));

    let (code, body) = get(addr, "/health").await;
    assert_eq!(code, 200);
    assert_eq!(body["status"], "up");
    assert_eq!(body["state"], "acquired");
    assert_eq!(body["node_id"], 0);
    assert_eq!(body["mode"], "leased");
    assert_eq!(body["lease_key"], "it:node:0");
    assert_eq!(body["max_node"], 8);
    assert_eq!(body["store"], "connected");
    assert!(body["sample_tsid"].as_u64().is_some());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_health_reports_degraded_node() {
    let file = config_file("[lease]\nallow_degraded = true\n");
    let config = DaemonConfig::load(Some(file.path())).unwrap();
    let node = daemon::bootstrap(&config).await.unwrap();
    assert!(node.assignment.is_degraded());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(daemon::serve(node, listener, shutdown.clone()));

    let (code, body) = get(addr, "/health").await;
    assert_eq!(code, 200);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["lease_key"], serde_json::Value::Null);
    assert_eq!(body["store"], "not_configured");
    assert!(!body["warnings"].as_array().unwrap().is_empty());

    shutdown.cancel();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_invalid_lease_config_is_rejected() {
    let file = config_file("[lease]\nmax_node = 2048\n");
    assert!(matches!(
        DaemonConfig::load(Some(file.path())),
        Err(ConfigError::Invalid(_))
    ));
}

#[cfg(feature = "redis")]
#[tokio::test]
async fn test_unreachable_redis_fails_fast_unless_degraded_allowed() {
    let mut config = DaemonConfig::default();
    config.store.endpoint = Some("redis://127.0.0.1:1".to_string());

    let err = daemon::bootstrap(&config).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<nodelease::Error>(),
        Some(nodelease::Error::Connectivity { .. })
    ));

    config.lease.allow_degraded = true;
    let node = daemon::bootstrap(&config).await.unwrap();
    assert!(node.assignment.is_degraded());
}
