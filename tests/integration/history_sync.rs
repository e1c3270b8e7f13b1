// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Integration tests for history retrieval across the hot cache and the
//! durable store, and for the sync job that moves messages between them.
//!
//! Verification command: `cargo test --test history_sync`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use duet_proto::api::{
    ErrorBody, HistoryResponse, PageQuery, StartChatRequest, StartChatResponse, USER_ID_HEADER,
};
use duet_proto::codec;
use duet_proto::message::{ChatMessage, ConversationId, Timestamp, UserId};
use duet_proto::stream::{ChatClientFrame, ChatServerFrame};
use duet_server::directory::{MemoryDirectory, UserProfile};
use duet_server::durable::{DurableStore, LogStore};
use duet_server::messenger::{Messenger, MessengerSettings};
use duet_server::server::{self, start_server_with_shutdown, start_server_with_state};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type Core = Messenger<LogStore, MemoryDirectory>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn directory() -> Arc<MemoryDirectory> {
    Arc::new(MemoryDirectory::with_users([
        UserProfile::new("alice", "Alice", "alice@example.com"),
        UserProfile::new("bob", "Bob", "bob@example.com"),
        UserProfile::new("carol", "Carol", "carol@example.com"),
    ]))
}

async fn serve(messenger: &Arc<Core>) -> SocketAddr {
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(messenger))
        .await
        .expect("failed to start test server");
    addr
}

async fn start_chat(addr: SocketAddr) -> ConversationId {
    let response: StartChatResponse = reqwest::Client::new()
        .post(format!("http://{addr}/start-chat"))
        .header(USER_ID_HEADER, "alice")
        .json(&StartChatRequest {
            counterpart_id: UserId::new("bob"),
        })
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    response.conversation_id
}

async fn join(addr: SocketAddr, conversation_id: ConversationId, user: &str) -> WsStream {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/private-chat"))
        .await
        .unwrap();
    let join = ChatClientFrame::Join {
        conversation_id,
        user_id: UserId::new(user),
    };
    ws.send(tungstenite::Message::Binary(codec::encode(&join).unwrap().into()))
        .await
        .unwrap();
    assert_eq!(recv(&mut ws).await, ChatServerFrame::Joined { conversation_id });
    ws
}

async fn recv(ws: &mut WsStream) -> ChatServerFrame {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("recv timed out")
            .expect("stream ended")
            .unwrap();
        if let tungstenite::Message::Binary(data) = msg {
            return codec::decode(&data).unwrap();
        }
    }
}

/// Sends `count` numbered messages back to back, waiting for each echo.
async fn send_numbered(ws: &mut WsStream, count: usize) {
    for i in 0..count {
        let frame = ChatClientFrame::Send {
            content: Some(format!("m{i:02}")),
        };
        ws.send(tungstenite::Message::Binary(codec::encode(&frame).unwrap().into()))
            .await
            .unwrap();
        assert!(matches!(recv(ws).await, ChatServerFrame::Message(_)));
    }
}

async fn fetch_history(
    addr: SocketAddr,
    caller: &str,
    conversation_id: ConversationId,
    query: PageQuery,
) -> reqwest::Response {
    let mut url = format!("http://{addr}/messages/{conversation_id}?");
    if let Some(before) = query.before {
        url.push_str(&format!("before={}&", before.as_millis()));
    }
    if let Some(limit) = query.limit {
        url.push_str(&format!("limit={limit}"));
    }
    reqwest::Client::new()
        .get(url)
        .header(USER_ID_HEADER, caller)
        .send()
        .await
        .unwrap()
}

async fn history(addr: SocketAddr, conversation_id: ConversationId, query: PageQuery) -> Vec<ChatMessage> {
    let response = fetch_history(addr, "bob", conversation_id, query).await;
    assert!(response.status().is_success(), "history failed: {}", response.status());
    response.json::<HistoryResponse>().await.unwrap().messages
}

fn contents(messages: &[ChatMessage]) -> Vec<String> {
    messages
        .iter()
        .map(|m| m.content.clone().unwrap_or_default())
        .collect()
}

fn numbered(range: impl DoubleEndedIterator<Item = usize>) -> Vec<String> {
    range.rev().map(|i| format!("m{i:02}")).collect()
}

fn journal_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("duet-{tag}-{}.jsonl", ConversationId::new()))
}

// =============================================================================
// Sync
// =============================================================================

#[tokio::test]
async fn sync_keeps_newest_window_cached() {
    let messenger = Arc::new(Messenger::new(
        Arc::new(LogStore::in_memory()),
        directory(),
        MessengerSettings::default(),
    ));
    let addr = serve(&messenger).await;
    let conv = start_chat(addr).await;
    let mut alice = join(addr, conv, "alice").await;
    send_numbered(&mut alice, 25).await;
    assert_eq!(messenger.cache().len(conv).await, 25);

    let report = messenger.sync_job().run_once().await;
    assert_eq!(report.messages_inserted, 25);
    assert_eq!(report.entries_trimmed, 5);
    assert_eq!(messenger.cache().len(conv).await, 20);

    // A second run has nothing new to write.
    let again = messenger.sync_job().run_once().await;
    assert_eq!(again.messages_inserted, 0);

    let newest = messenger.store().latest_message(conv).await.unwrap().unwrap();
    assert_eq!(newest.content.as_deref(), Some("m24"));
}

#[tokio::test]
async fn history_pages_cross_from_cache_to_store() {
    let messenger = Arc::new(Messenger::new(
        Arc::new(LogStore::in_memory()),
        directory(),
        MessengerSettings::default(),
    ));
    let addr = serve(&messenger).await;
    let conv = start_chat(addr).await;
    let mut alice = join(addr, conv, "alice").await;
    send_numbered(&mut alice, 25).await;
    messenger.sync_job().run_once().await;

    let first = history(addr, conv, PageQuery { before: None, limit: Some(20) }).await;
    assert_eq!(contents(&first), numbered(5..25));

    let before = first.last().unwrap().timestamp;
    let second = history(addr, conv, PageQuery { before: Some(before), limit: Some(20) }).await;
    assert_eq!(contents(&second), numbered(0..5));

    let before = second.last().unwrap().timestamp;
    let third = history(addr, conv, PageQuery { before: Some(before), limit: Some(20) }).await;
    assert!(third.is_empty());
}

#[tokio::test]
async fn unsynced_messages_are_served_from_cache() {
    let messenger = Arc::new(Messenger::new(
        Arc::new(LogStore::in_memory()),
        directory(),
        MessengerSettings::default(),
    ));
    let addr = serve(&messenger).await;
    let conv = start_chat(addr).await;
    let mut alice = join(addr, conv, "alice").await;
    send_numbered(&mut alice, 3).await;

    assert!(messenger.store().latest_message(conv).await.unwrap().is_none());
    let page = history(addr, conv, PageQuery::default()).await;
    assert_eq!(contents(&page), numbered(0..3));
}

#[tokio::test]
async fn background_sync_flushes_on_shutdown() {
    let messenger = Arc::new(Messenger::new(
        Arc::new(LogStore::in_memory()),
        directory(),
        MessengerSettings::default(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = Arc::clone(messenger.sync_job()).spawn(Duration::from_secs(3600), shutdown_rx);

    let addr = serve(&messenger).await;
    let conv = start_chat(addr).await;
    let mut alice = join(addr, conv, "alice").await;
    send_numbered(&mut alice, 4).await;

    shutdown_tx.send(true).unwrap();
    let report = tokio::time::timeout(RECV_TIMEOUT, task).await.unwrap().unwrap();
    assert_eq!(report.messages_inserted, 4);
    assert_eq!(
        messenger
            .store()
            .messages_before(conv, Timestamp::MAX, 10)
            .await
            .unwrap()
            .len(),
        4
    );
}

#[tokio::test]
async fn drain_stops_accepting_then_flushes() {
    let messenger = Arc::new(Messenger::new(
        Arc::new(LogStore::in_memory()),
        directory(),
        MessengerSettings::default(),
    ));
    let (sync_stop, sync_rx) = watch::channel(false);
    let sync_task = Arc::clone(messenger.sync_job()).spawn(Duration::from_secs(3600), sync_rx);

    let (server_stop, mut server_rx) = watch::channel(false);
    let stop_accepting = async move {
        let _ = server_rx.wait_for(|stop| *stop).await;
    };
    let (addr, handle) =
        start_server_with_shutdown("127.0.0.1:0", Arc::clone(&messenger), stop_accepting)
            .await
            .unwrap();
    let conv = start_chat(addr).await;
    let mut alice = join(addr, conv, "alice").await;
    send_numbered(&mut alice, 3).await;

    let report = tokio::time::timeout(
        RECV_TIMEOUT,
        server::drain(&messenger, &server_stop, handle, &sync_stop, Some(sync_task)),
    )
    .await
    .unwrap();
    assert_eq!(report.messages_inserted, 3);
    let stored = messenger
        .store()
        .messages_before(conv, Timestamp::MAX, 10)
        .await
        .unwrap();
    assert_eq!(stored.len(), 3);

    // The listener is gone and the live stream was closed.
    assert!(
        tokio_tungstenite::connect_async(format!("ws://{addr}/private-chat"))
            .await
            .is_err()
    );
    loop {
        match tokio::time::timeout(RECV_TIMEOUT, alice.next())
            .await
            .expect("close timed out")
        {
            None | Some(Err(_) | Ok(tungstenite::Message::Close(_))) => break,
            Some(Ok(tungstenite::Message::Binary(_))) => panic!("expected close"),
            Some(Ok(_)) => {}
        }
    }
}

// =============================================================================
// Access
// =============================================================================

#[tokio::test]
async fn history_requires_participation() {
    let messenger = Arc::new(Messenger::new(
        Arc::new(LogStore::in_memory()),
        directory(),
        MessengerSettings::default(),
    ));
    let addr = serve(&messenger).await;
    let conv = start_chat(addr).await;

    let response = fetch_history(addr, "carol", conv, PageQuery::default()).await;
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: ErrorBody = response.json().await.unwrap();
    assert_eq!(body.code, "unauthorized");

    let response = fetch_history(addr, "alice", ConversationId::new(), PageQuery::default()).await;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let response = reqwest::Client::new()
        .get(format!("http://{addr}/messages/not-a-uuid"))
        .header(USER_ID_HEADER, "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

// =============================================================================
// Restart
// =============================================================================

#[tokio::test]
async fn journal_survives_restart() {
    let path = journal_path("restart");

    let conv = {
        let messenger = Arc::new(Messenger::new(
            Arc::new(LogStore::open(&path).await.unwrap()),
            directory(),
            MessengerSettings::default(),
        ));
        let addr = serve(&messenger).await;
        let conv = start_chat(addr).await;
        let mut alice = join(addr, conv, "alice").await;
        send_numbered(&mut alice, 3).await;
        messenger.close_all();
        messenger.sync_job().run_once().await;
        conv
    };

    let restarted = Arc::new(Messenger::new(
        Arc::new(LogStore::open(&path).await.unwrap()),
        directory(),
        MessengerSettings::default(),
    ));
    let addr = serve(&restarted).await;

    let page = history(addr, conv, PageQuery::default()).await;
    assert_eq!(contents(&page), numbered(0..3));

    // No session exists in the new process; joining restores it.
    let mut bob = join(addr, conv, "bob").await;
    let frame = ChatClientFrame::Send {
        content: Some("back".into()),
    };
    bob.send(tungstenite::Message::Binary(codec::encode(&frame).unwrap().into()))
        .await
        .unwrap();
    assert!(matches!(recv(&mut bob).await, ChatServerFrame::Message(_)));

    let _ = std::fs::remove_file(&path);
}
