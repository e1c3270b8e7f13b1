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

//! Integration tests for the chat list: the `/chats` endpoint and the
//! chat-list stream.
//!
//! Verification command: `cargo test --test chat_list`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use duet_proto::api::{ChatListResponse, StartChatRequest, StartChatResponse, USER_ID_HEADER};
use duet_proto::codec;
use duet_proto::message::{ConversationId, UserId};
use duet_proto::stream::{
    ChatClientFrame, ChatListClientFrame, ChatListServerFrame, ChatListUpdate, ChatServerFrame,
};
use duet_server::directory::{MemoryDirectory, UserProfile};
use duet_server::durable::LogStore;
use duet_server::messenger::{Messenger, MessengerSettings};
use duet_server::server::start_server_with_state;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn start() -> SocketAddr {
    let directory = MemoryDirectory::with_users([
        UserProfile::new("alice", "Alice", "alice@example.com"),
        UserProfile::new("bob", "Bob", "bob@example.com"),
        UserProfile::new("carol", "Carol", "carol@example.com"),
    ]);
    let messenger = Arc::new(Messenger::new(
        Arc::new(LogStore::in_memory()),
        Arc::new(directory),
        MessengerSettings::default(),
    ));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", messenger)
        .await
        .expect("failed to start test server");
    addr
}

async fn start_chat(addr: SocketAddr, caller: &str, counterpart: &str) -> ConversationId {
    let response: StartChatResponse = reqwest::Client::new()
        .post(format!("http://{addr}/start-chat"))
        .header(USER_ID_HEADER, caller)
        .json(&StartChatRequest {
            counterpart_id: UserId::new(counterpart),
        })
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    response.conversation_id
}

async fn list_chats(addr: SocketAddr, caller: &str) -> ChatListResponse {
    reqwest::Client::new()
        .get(format!("http://{addr}/chats"))
        .header(USER_ID_HEADER, caller)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn connect(addr: SocketAddr, path: &str, header_user: Option<&str>) -> WsStream {
    let mut request = format!("ws://{addr}{path}").into_client_request().unwrap();
    if let Some(user) = header_user {
        request
            .headers_mut()
            .insert(USER_ID_HEADER, user.parse().unwrap());
    }
    let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    ws
}

async fn send<T: Serialize>(ws: &mut WsStream, frame: &T) {
    let bytes = codec::encode(frame).unwrap();
    ws.send(tungstenite::Message::Binary(bytes.into()))
        .await
        .unwrap();
}

async fn recv<T: DeserializeOwned>(ws: &mut WsStream) -> T {
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

async fn recv_update(ws: &mut WsStream) -> ChatListUpdate {
    match recv(ws).await {
        ChatListServerFrame::Update(update) => update,
        other => panic!("expected Update, got {other:?}"),
    }
}

async fn subscribe(addr: SocketAddr, user: &str) -> WsStream {
    let mut ws = connect(addr, "/chat-list/stream", Some(user)).await;
    send(
        &mut ws,
        &ChatListClientFrame::Subscribe {
            user_id: UserId::new(user),
        },
    )
    .await;
    let ack: ChatListServerFrame = recv(&mut ws).await;
    assert_eq!(
        ack,
        ChatListServerFrame::Subscribed {
            user_id: UserId::new(user)
        }
    );
    ws
}

async fn join(addr: SocketAddr, conversation_id: ConversationId, user: &str) -> WsStream {
    let mut ws = connect(addr, "/private-chat", None).await;
    send(
        &mut ws,
        &ChatClientFrame::Join {
            conversation_id,
            user_id: UserId::new(user),
        },
    )
    .await;
    let ack: ChatServerFrame = recv(&mut ws).await;
    assert_eq!(ack, ChatServerFrame::Joined { conversation_id });
    ws
}

// =============================================================================
// Stream
// =============================================================================

#[tokio::test]
async fn recipient_chat_list_sees_new_message() {
    let addr = start().await;
    let conv = start_chat(addr, "bob", "alice").await;
    let mut alice_list = subscribe(addr, "alice").await;

    let mut bob = join(addr, conv, "bob").await;
    send(
        &mut bob,
        &ChatClientFrame::Send {
            content: Some("hello".into()),
        },
    )
    .await;

    let update = recv_update(&mut alice_list).await;
    assert!(!update.no_data);
    let summary = update.data.unwrap();
    assert_eq!(summary.conversation_id, conv);
    assert_eq!(summary.counterpart_id, UserId::new("bob"));
    assert_eq!(summary.counterpart_name, "Bob");
    assert_eq!(summary.latest_message.as_deref(), Some("hello"));
    assert!(summary.latest_message_time.is_some());
}

#[tokio::test]
async fn start_direct_replies_on_the_stream() {
    let addr = start().await;
    let mut alice_list = subscribe(addr, "alice").await;

    send(
        &mut alice_list,
        &ChatListClientFrame::StartDirect {
            counterpart_id: UserId::new("ghost"),
        },
    )
    .await;
    assert_eq!(recv_update(&mut alice_list).await, ChatListUpdate::no_data());

    send(
        &mut alice_list,
        &ChatListClientFrame::StartDirect {
            counterpart_id: UserId::new("carol"),
        },
    )
    .await;
    let summary = recv_update(&mut alice_list).await.data.unwrap();
    assert_eq!(summary.counterpart_id, UserId::new("carol"));
    assert_eq!(summary.counterpart_name, "Carol");
    assert!(summary.latest_message.is_none());
}

#[tokio::test]
async fn subscribe_contradicting_header_is_closed() {
    let addr = start().await;
    let mut ws = connect(addr, "/chat-list/stream", Some("bob")).await;
    send(
        &mut ws,
        &ChatListClientFrame::Subscribe {
            user_id: UserId::new("alice"),
        },
    )
    .await;
    loop {
        match tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("close timed out")
        {
            None | Some(Err(_) | Ok(tungstenite::Message::Close(_))) => break,
            Some(Ok(tungstenite::Message::Binary(_))) => panic!("expected close"),
            Some(Ok(_)) => {}
        }
    }
}

#[tokio::test]
async fn resubscribing_replaces_the_channel() {
    let addr = start().await;
    let conv = start_chat(addr, "bob", "alice").await;
    let _old = subscribe(addr, "alice").await;
    let mut new = subscribe(addr, "alice").await;

    let mut bob = join(addr, conv, "bob").await;
    send(
        &mut bob,
        &ChatClientFrame::Send {
            content: Some("to the newest".into()),
        },
    )
    .await;
    let summary = recv_update(&mut new).await.data.unwrap();
    assert_eq!(summary.latest_message.as_deref(), Some("to the newest"));
}

// =============================================================================
// HTTP listing
// =============================================================================

#[tokio::test]
async fn chats_are_listed_most_recent_first() {
    let addr = start().await;
    assert!(list_chats(addr, "alice").await.no_data);

    let with_bob = start_chat(addr, "alice", "bob").await;
    let with_carol = start_chat(addr, "alice", "carol").await;

    // Keep the message's timestamp clear of the second conversation's.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut alice = join(addr, with_bob, "alice").await;
    send(
        &mut alice,
        &ChatClientFrame::Send {
            content: Some("latest".into()),
        },
    )
    .await;
    let _: ChatServerFrame = recv(&mut alice).await;

    let listed = list_chats(addr, "alice").await;
    assert!(!listed.no_data);
    let ids: Vec<_> = listed.conversations.iter().map(|s| s.conversation_id).collect();
    assert_eq!(ids, vec![with_bob, with_carol]);
    assert_eq!(listed.conversations[0].latest_message.as_deref(), Some("latest"));
    assert!(listed.conversations[1].latest_message.is_none());

    let carol = list_chats(addr, "carol").await;
    assert_eq!(carol.conversations.len(), 1);
    assert_eq!(carol.conversations[0].counterpart_id, UserId::new("alice"));
}
