//! End-to-end tests for the SSE reader against a local stream fixture.

use pleiades::sse::{self, SseError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

const FIRST_ID: &str = r#"[{"topic":"eqiad.mediawiki.recentchange","partition":0,"timestamp":1596207527001},{"topic":"codfw.mediawiki.recentchange","partition":0,"offset":-1}]"#;
const SECOND_ID: &str = r#"[{"topic":"eqiad.mediawiki.recentchange","partition":0,"timestamp":1596207527002},{"topic":"codfw.mediawiki.recentchange","partition":0,"offset":-1}]"#;

fn two_event_stream() -> Vec<String> {
    vec![
        ":ok".to_string(),
        "event: message".to_string(),
        format!("id: {}", FIRST_ID),
        r#"data: {"$schema":"/mediawiki/recentchange/1.0.0","wiki":"hewiki","type":"edit","length":{"old":4905,"new":4905}}"#.to_string(),
        String::new(),
        "event: message".to_string(),
        format!("id: {}", SECOND_ID),
        r#"data: {"$schema":"/mediawiki/recentchange/1.0.0","#.to_string(),
        r#"data: "wiki":"hewiki","type":"edit","length":{"old":10,"new":13}}"#.to_string(),
    ]
}

/// Accept one connection, return the raw request, and answer with the given
/// body lines as a `text/event-stream` response, then close.
async fn serve_once(listener: TcpListener, body_lines: Vec<String>) -> String {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut request = vec![0u8; 4096];
    let n = socket.read(&mut request).await.unwrap();
    let request = String::from_utf8_lossy(&request[..n]).into_owned();

    let mut body = String::new();
    for line in body_lines {
        body.push_str(&line);
        body.push('\n');
    }
    body.push('\n');
    body.push('\n');
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    socket.write_all(response.as_bytes()).await.unwrap();
    socket.shutdown().await.unwrap();
    request
}

#[tokio::test]
async fn reads_and_processes_events() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_once(listener, two_event_stream()));

    let (tx, mut rx) = mpsc::channel(16);
    let (_stop_tx, mut stop_rx) = watch::channel(false);
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });

    let (last_event_id, result) =
        sse::notify(&format!("http://{}", addr), None, &tx, &mut stop_rx).await;
    drop(tx);

    // The fixture closes the connection after the body; that is a resumable
    // stream end, not a clean stop.
    assert!(matches!(result, Err(SseError::StreamClosed)));

    let events = collector.await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, "message");
    assert_eq!(events[1].event_type, "message");
    assert_eq!(events[0].id, FIRST_ID);
    assert_eq!(events[1].id, SECOND_ID);
    // The split data lines arrive concatenated, no separator.
    assert_eq!(
        events[1].data,
        r#"{"$schema":"/mediawiki/recentchange/1.0.0","wiki":"hewiki","type":"edit","length":{"old":10,"new":13}}"#
    );
    assert_eq!(last_event_id, SECOND_ID);

    let request = server.await.unwrap();
    assert!(!request.contains("Last-Event-ID"));
}

#[tokio::test]
async fn resume_token_is_sent_as_last_event_id_header() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_once(listener, vec![":ok".to_string()]));

    let (tx, mut rx) = mpsc::channel(16);
    let (_stop_tx, mut stop_rx) = watch::channel(false);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let (last_event_id, result) = sse::notify(
        &format!("http://{}", addr),
        Some("resume-token-123"),
        &tx,
        &mut stop_rx,
    )
    .await;
    drop(tx);
    drain.await.unwrap();

    assert!(matches!(result, Err(SseError::StreamClosed)));
    assert_eq!(last_event_id, "");

    let request = server.await.unwrap();
    assert!(request.contains("last-event-id: resume-token-123")
        || request.contains("Last-Event-ID: resume-token-123"));
}

#[tokio::test]
async fn comment_only_stream_emits_no_events() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_once(
        listener,
        vec![":ok".to_string(), String::new(), ":keepalive".to_string()],
    ));

    let (tx, mut rx) = mpsc::channel(16);
    let (_stop_tx, mut stop_rx) = watch::channel(false);
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });

    let (last_event_id, _) =
        sse::notify(&format!("http://{}", addr), None, &tx, &mut stop_rx).await;
    drop(tx);

    assert!(collector.await.unwrap().is_empty());
    assert_eq!(last_event_id, "");
    server.await.unwrap();
}

#[tokio::test]
async fn closed_channel_is_a_fatal_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // No server task; the reader must bail before connecting.

    let (tx, rx) = mpsc::channel::<pleiades::Event>(1);
    drop(rx);
    let (_stop_tx, mut stop_rx) = watch::channel(false);

    let (_, result) = sse::notify(&format!("http://{}", addr), None, &tx, &mut stop_rx).await;
    assert!(matches!(result, Err(SseError::ChannelClosed)));
}
