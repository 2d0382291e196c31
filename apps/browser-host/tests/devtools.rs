mod support;

use browser_host::{
    cdp::{CdpError, CdpSession, EventSink, WsCdpClient, WsCdpConnector},
    viewer::ViewerHandle,
    StreamingHost,
};
use browser_proto::HostMessage;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use support::{eventually, next_message, quick_settings, FakeLocator};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Single-connection DevTools endpoint. Every command is recorded and
/// answered with `{"method": <name>}`, except `Silent.*` (never answered)
/// and `Held.*` (answered in reverse order once two have arrived).
struct FakeDevTools {
    addr: SocketAddr,
    received: mpsc::UnboundedReceiver<Value>,
    push: mpsc::UnboundedSender<Option<Value>>,
}

impl FakeDevTools {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind devtools");
        let addr = listener.local_addr().expect("devtools addr");
        let (received_tx, received) = mpsc::unbounded_channel();
        let (push, mut push_rx) = mpsc::unbounded_channel::<Option<Value>>();

        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(ws) = accept_async(stream).await else {
                return;
            };
            let (mut sink, mut source) = ws.split();
            let mut held: Vec<(Value, String)> = Vec::new();
            loop {
                tokio::select! {
                    frame = source.next() => {
                        let command: Value = match frame {
                            Some(Ok(Message::Text(text))) => {
                                serde_json::from_str(&text).expect("command is json")
                            }
                            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                                let _ = received_tx.send(json!({"closed": true}));
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };
                        let _ = received_tx.send(command.clone());
                        let id = command["id"].clone();
                        let method = command["method"].as_str().unwrap_or_default().to_string();
                        if method.starts_with("Silent.") {
                            continue;
                        }
                        if method.starts_with("Held.") {
                            held.push((id, method));
                            if held.len() == 2 {
                                for (id, method) in held.drain(..).rev() {
                                    let _ = sink.send(reply(id, &method)).await;
                                }
                            }
                            continue;
                        }
                        let _ = sink.send(reply(id, &method)).await;
                    }
                    push = push_rx.recv() => match push {
                        Some(Some(event)) => {
                            let _ = sink.send(Message::Text(event.to_string())).await;
                        }
                        Some(None) | None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    },
                }
            }
        });

        Self {
            addr,
            received,
            push,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/devtools/page/TEST", self.addr)
    }

    fn event(&self, method: &str, params: Value) {
        self.push
            .send(Some(json!({"method": method, "params": params})))
            .expect("devtools running");
    }

    fn hang_up(&self) {
        self.push.send(None).expect("devtools running");
    }

    async fn next_command(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(2), self.received.recv())
            .await
            .expect("command within deadline")
            .expect("devtools running")
    }

    async fn next_method(&mut self) -> String {
        let command = self.next_command().await;
        command["method"].as_str().unwrap_or_default().to_string()
    }
}

fn reply(id: Value, method: &str) -> Message {
    Message::Text(json!({"id": id, "result": {"method": method}}).to_string())
}

async fn client_for(
    devtools: &FakeDevTools,
    call_timeout: Duration,
) -> (WsCdpClient, mpsc::Receiver<browser_host::cdp::CdpEvent>) {
    let (tx, rx) = mpsc::channel(4);
    let client = WsCdpClient::connect(
        &devtools.url(),
        EventSink::new(&["Page.screencastFrame"], tx),
        call_timeout,
    )
    .await
    .expect("connects to devtools");
    (client, rx)
}

#[test_timeout::tokio_timeout_test(15)]
async fn concurrent_calls_get_their_own_replies() {
    let mut devtools = FakeDevTools::start().await;
    let (client, _events) = client_for(&devtools, Duration::from_secs(2)).await;

    let (first, second) = tokio::join!(
        client.call("Held.first", json!({})),
        client.call("Held.second", json!({}))
    );

    assert_eq!(first.expect("first reply")["method"], "Held.first");
    assert_eq!(second.expect("second reply")["method"], "Held.second");
    let a = devtools.next_command().await;
    let b = devtools.next_command().await;
    assert_ne!(a["id"], b["id"]);
}

#[test_timeout::tokio_timeout_test(15)]
async fn unanswered_call_times_out_and_client_keeps_working() {
    let devtools = FakeDevTools::start().await;
    let (client, _events) = client_for(&devtools, Duration::from_millis(200)).await;

    match client.call("Silent.wait", json!({})).await {
        Err(CdpError::Timeout { method }) => assert_eq!(method, "Silent.wait"),
        other => panic!("expected timeout, got {other:?}"),
    }
    let result = client.call("Page.enable", json!({})).await.expect("later call");
    assert_eq!(result["method"], "Page.enable");
}

#[test_timeout::tokio_timeout_test(15)]
async fn close_sends_handshake_and_rejects_later_calls() {
    let mut devtools = FakeDevTools::start().await;
    let (client, _events) = client_for(&devtools, Duration::from_secs(2)).await;

    client.close().await;

    assert_eq!(devtools.next_command().await, json!({"closed": true}));
    assert!(matches!(
        client.call("Page.enable", json!({})).await,
        Err(CdpError::Closed)
    ));
}

#[test_timeout::tokio_timeout_test(15)]
async fn browser_hangup_ends_event_stream() {
    let devtools = FakeDevTools::start().await;
    let (client, mut events) = client_for(&devtools, Duration::from_secs(2)).await;

    devtools.event("Page.screencastFrame", json!({"data": "a", "sessionId": 1}));
    let event = events.recv().await.expect("frame delivered");
    assert_eq!(event.params["sessionId"], 1);

    devtools.hang_up();
    assert!(events.recv().await.is_none());
    assert!(matches!(
        client.call("Page.enable", json!({})).await,
        Err(CdpError::Closed)
    ));
}

#[test_timeout::tokio_timeout_test(20)]
async fn frames_are_acked_over_the_wire_despite_console_noise() {
    let mut devtools = FakeDevTools::start().await;
    let host = StreamingHost::new(
        FakeLocator::at(&devtools.url()),
        Arc::new(WsCdpConnector::new(Duration::from_secs(2))),
        quick_settings(),
    );
    let (viewer, mut rx) = ViewerHandle::channel(8);

    host.handle_text(
        &viewer,
        &json!({"type": "start-streaming", "sessionId": "s1"}).to_string(),
    )
    .await;
    match next_message(&mut rx).await {
        HostMessage::StreamingStarted { cdp_endpoint, .. } => {
            assert_eq!(cdp_endpoint, devtools.url())
        }
        other => panic!("expected streaming-started, got {other:?}"),
    }
    assert_eq!(devtools.next_method().await, "Page.enable");
    assert_eq!(devtools.next_method().await, "Runtime.enable");
    assert_eq!(devtools.next_method().await, "Page.startScreencast");

    // More chatter than the event queue holds, then a frame.
    for n in 0..quick_settings().frame_buffer * 3 {
        devtools.event("Runtime.consoleAPICalled", json!({"type": "log", "n": n}));
    }
    devtools.event(
        "Page.screencastFrame",
        json!({"data": "jpeg-bytes", "sessionId": 42, "metadata": {}}),
    );

    let ack = devtools.next_command().await;
    assert_eq!(ack["method"], "Page.screencastFrameAck");
    assert_eq!(ack["params"]["sessionId"], 42);
    match next_message(&mut rx).await {
        HostMessage::Frame {
            data, session_id, ..
        } => {
            assert_eq!(data, "jpeg-bytes");
            assert_eq!(session_id, "s1");
        }
        other => panic!("expected frame, got {other:?}"),
    }

    devtools.hang_up();
    match next_message(&mut rx).await {
        HostMessage::Error { session_id, error } => {
            assert_eq!(session_id.as_deref(), Some("s1"));
            assert_eq!(error, "Browser connection lost");
        }
        other => panic!("expected error, got {other:?}"),
    }
    eventually(|| host.active_sessions() == 0).await;
}
