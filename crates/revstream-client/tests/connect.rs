use core::time::Duration;
use revstream_client::{ClientConfig, SearchClient};
use revstream_core::Error;
use tokio::net::TcpListener;

async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn unreachable_server_is_a_hard_error() {
    let port = unused_port().await;
    let mut config = ClientConfig::new(format!("http://127.0.0.1:{port}"));
    config.connect_timeout = Duration::from_millis(500);

    let err = SearchClient::connect(config).await.unwrap_err();
    assert!(matches!(err, Error::Connect { .. }), "got {err:?}");
    assert!(err.is_hard());
}

#[tokio::test]
async fn malformed_url_is_a_connect_error() {
    let err = SearchClient::connect(ClientConfig::new("not a url"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Connect { .. }), "got {err:?}");
}
