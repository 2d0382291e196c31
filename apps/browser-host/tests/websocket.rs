mod support;

use browser_host::{router, AppState, StreamingHost};
use browser_proto::HostMessage;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::{net::SocketAddr, time::Duration};
use support::*;
use tokio_tungstenite::{connect_async, tungstenite::Message};

async fn serve(host: StreamingHost) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let app = router(AppState {
        host,
        metrics: None,
    });
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

async fn next_host_message<S>(ws: &mut S) -> HostMessage
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame within deadline")
            .expect("socket open")
            .expect("valid frame");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("host message");
        }
    }
}

#[test_timeout::tokio_timeout_test(15)]
async fn viewer_session_over_websocket() {
    let connector = FakeConnector::new();
    let host = host_with(FakeLocator::ready(), connector.clone());
    let addr = serve(host.clone()).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/"))
        .await
        .expect("viewer connects");

    ws.send(Message::Text("garbage".into()))
        .await
        .expect("send garbage");
    assert_eq!(
        next_host_message(&mut ws).await,
        HostMessage::error(None, "Invalid message format")
    );

    ws.send(Message::Text(
        json!({"type": "start-streaming", "sessionId": "s1"}).to_string(),
    ))
    .await
    .expect("send start");
    assert_eq!(
        next_host_message(&mut ws).await,
        HostMessage::StreamingStarted {
            session_id: "s1".into(),
            cdp_endpoint: ENDPOINT.into(),
        }
    );

    connector.emit_frame(0, 42).await;
    assert!(matches!(
        next_host_message(&mut ws).await,
        HostMessage::Frame { ref data, .. } if data == "frame-42"
    ));

    ws.close(None).await.expect("close viewer");
    let cdp = connector.latest();
    eventually(|| cdp.is_closed()).await;
    eventually(|| host.active_sessions() == 0).await;
}

#[test_timeout::tokio_timeout_test(15)]
async fn health_reports_active_sessions() {
    let host = host_with(FakeLocator::ready(), FakeConnector::new());
    let addr = serve(host.clone()).await;

    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .expect("health request")
        .json()
        .await
        .expect("health json");
    assert_eq!(
        body,
        json!({"status": "ok", "service": "browser-host", "activeSessions": 0})
    );
}
