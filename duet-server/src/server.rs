//! HTTP and WebSocket surface of the messaging core.
//!
//! HTTP endpoints take the caller's identity from the `x-user-id` header set
//! by the upstream gateway. Each WebSocket connection is served by a reader
//! task and a writer task:
//!
//! * the reader decodes client frames and drives the [`Messenger`];
//! * the writer drains the connection's outbound queue, plus a small control
//!   queue the reader uses for replies and notices, onto the socket.
//!
//! When the reader ends, the writer gets a short grace period to flush what
//! is queued (e.g. a final notice) before it is aborted. When the writer ends
//! first, the reader is aborted. Either way the connection is detached
//! exactly once by its guard.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use duet_proto::api::{
    HistoryResponse, NewChatQuery, PageQuery, StartChatRequest, USER_ID_HEADER,
};
use duet_proto::codec;
use duet_proto::message::{ConversationId, UserId};
use duet_proto::stream::{
    ChatClientFrame, ChatListClientFrame, ChatListServerFrame, ChatListUpdate, ChatServerFrame,
    Notice, NoticeCode,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::directory::Directory;
use crate::durable::DurableStore;
use crate::error::ChatError;
use crate::messenger::Messenger;
use crate::sessions::Attachment;
use crate::sync::SyncReport;

/// How long a client has to send its handshake frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the writer may keep flushing after the reader has finished.
const WRITER_GRACE: Duration = Duration::from_secs(2);

/// Depth of the per-connection control queue.
const CONTROL_QUEUE_SIZE: usize = 8;

type SharedMessenger<S, D> = Arc<Messenger<S, D>>;
type ServerHandle = (SocketAddr, JoinHandle<()>);
type ServerError = Box<dyn std::error::Error + Send + Sync>;

/// The authenticated caller, read from the `x-user-id` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller(pub UserId);

impl<St: Send + Sync> FromRequestParts<St> for Caller {
    type Rejection = ChatError;

    async fn from_request_parts(parts: &mut Parts, _state: &St) -> Result<Self, Self::Rejection> {
        caller_from_headers(&parts.headers)
            .map(Self)
            .ok_or_else(|| ChatError::Unauthorized(format!("missing {USER_ID_HEADER} header")))
    }
}

fn caller_from_headers(headers: &HeaderMap) -> Option<UserId> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(UserId::new)
}

/// Builds the router over a messenger.
pub fn router<S: DurableStore, D: Directory>(messenger: SharedMessenger<S, D>) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health))
        .route("/start-chat", post(start_chat::<S, D>))
        .route("/new-chat", get(new_chat::<S, D>))
        .route("/messages/{conversation_id}", get(history::<S, D>))
        .route("/chats", get(list_chats::<S, D>))
        .route("/private-chat", get(private_chat_ws::<S, D>))
        .route("/chat-list/stream", get(chat_list_ws::<S, D>))
        .with_state(messenger)
}

/// Starts the server on `addr` and returns the bound address and a join
/// handle. The server runs until the handle is aborted.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state<S: DurableStore, D: Directory>(
    addr: &str,
    messenger: SharedMessenger<S, D>,
) -> Result<ServerHandle, ServerError> {
    start_server_with_shutdown(addr, messenger, std::future::pending()).await
}

/// Like [`start_server_with_state`], stopping to accept connections once
/// `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_shutdown<S: DurableStore, D: Directory>(
    addr: &str,
    messenger: SharedMessenger<S, D>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<ServerHandle, ServerError> {
    let app = router(messenger);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %e, "server error");
        }
    });
    Ok((bound_addr, handle))
}

/// Shuts a running server down in order: stop accepting connections and
/// wait for the listener task, close every live stream, then stop the sync
/// task and return its final report.
///
/// Without a sync task, or if it panicked, one last sync pass runs here.
pub async fn drain<S: DurableStore, D: Directory>(
    messenger: &Messenger<S, D>,
    server_stop: &watch::Sender<bool>,
    server: JoinHandle<()>,
    sync_stop: &watch::Sender<bool>,
    sync_task: Option<JoinHandle<SyncReport>>,
) -> SyncReport {
    let _ = server_stop.send(true);
    if let Err(e) = server.await {
        tracing::error!(error = %e, "server task failed");
    }
    tracing::debug!("listener stopped, closing live streams");

    messenger.close_all();

    let _ = sync_stop.send(true);
    if let Some(task) = sync_task {
        match task.await {
            Ok(report) => return report,
            Err(e) => tracing::error!(error = %e, "sync task failed"),
        }
    }
    messenger.sync_job().run_once().await
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

async fn health() -> &'static str {
    "ok"
}

async fn start_chat<S: DurableStore, D: Directory>(
    State(messenger): State<SharedMessenger<S, D>>,
    Caller(caller): Caller,
    Json(request): Json<StartChatRequest>,
) -> Result<impl IntoResponse, ChatError> {
    let response = messenger.start_chat(&caller, &request.counterpart_id).await?;
    Ok(Json(response))
}

async fn new_chat<S: DurableStore, D: Directory>(
    State(messenger): State<SharedMessenger<S, D>>,
    Caller(caller): Caller,
    Query(query): Query<NewChatQuery>,
) -> Result<impl IntoResponse, ChatError> {
    let response = messenger.start_chat_by_email(&caller, &query.email).await?;
    Ok(Json(response))
}

async fn history<S: DurableStore, D: Directory>(
    State(messenger): State<SharedMessenger<S, D>>,
    Caller(caller): Caller,
    Path(conversation_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, ChatError> {
    let conversation_id: ConversationId = conversation_id
        .parse()
        .map_err(|e| ChatError::InvalidArgument(format!("conversation id: {e}")))?;
    let messages = messenger.history(&caller, conversation_id, query).await?;
    Ok(Json(HistoryResponse { messages }))
}

async fn list_chats<S: DurableStore, D: Directory>(
    State(messenger): State<SharedMessenger<S, D>>,
    Caller(caller): Caller,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, ChatError> {
    Ok(Json(messenger.list_chats(&caller, query).await?))
}

// ---------------------------------------------------------------------------
// Conversation stream
// ---------------------------------------------------------------------------

async fn private_chat_ws<S: DurableStore, D: Directory>(
    ws: WebSocketUpgrade,
    State(messenger): State<SharedMessenger<S, D>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let claimed = caller_from_headers(&headers);
    ws.on_upgrade(move |socket| handle_chat_socket(socket, messenger, claimed))
}

/// Serves one conversation stream.
///
/// 1. Wait for `Join`; reject if it contradicts the `x-user-id` header.
/// 2. Attach (restoring the session from the store if needed); reply `Joined`.
/// 3. Run the reader and writer until either ends.
async fn handle_chat_socket<S: DurableStore, D: Directory>(
    socket: WebSocket,
    messenger: SharedMessenger<S, D>,
    claimed: Option<UserId>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(ChatClientFrame::Join {
        conversation_id,
        user_id,
    }) = wait_for_handshake(&mut ws_receiver).await
    else {
        tracing::warn!("conversation stream closed before a valid Join");
        let notice = Notice::new(NoticeCode::InvalidHandshake, "expected Join");
        reject(&mut ws_sender, &ChatServerFrame::Notice(notice)).await;
        return;
    };

    if claimed.as_ref().is_some_and(|claimed| *claimed != user_id) {
        tracing::warn!(conversation_id = %conversation_id, user_id = %user_id, "Join contradicts caller header");
        let notice = ChatError::Unauthorized("identity mismatch".into()).to_notice();
        reject(&mut ws_sender, &ChatServerFrame::Notice(notice)).await;
        return;
    }

    let Attachment { handle, outbound } = match messenger.attach(conversation_id, &user_id).await {
        Ok(attachment) => attachment,
        Err(e) => {
            tracing::warn!(conversation_id = %conversation_id, user_id = %user_id, error = %e, "attach rejected");
            reject(&mut ws_sender, &ChatServerFrame::Notice(e.to_notice())).await;
            return;
        }
    };
    let mut guard = messenger.guard(handle);

    if let Err(e) = send_frame(&mut ws_sender, &ChatServerFrame::Joined { conversation_id }).await {
        tracing::warn!(conversation_id = %conversation_id, error = %e, "failed to send Joined");
        return;
    }
    guard.mark_streaming();

    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_SIZE);

    let write_task = tokio::spawn(async move {
        let mut control = control_rx;
        let mut outbound = outbound;
        loop {
            let frame = tokio::select! {
                biased;
                Some(frame) = control.recv() => frame,
                frame = outbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let terminal = matches!(&frame, ChatServerFrame::Notice(n) if n.is_terminal());
            if let Err(e) = send_frame(&mut ws_sender, &frame).await {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "WebSocket write failed");
                return;
            }
            if terminal {
                break;
            }
        }
        // Flush notices queued just before the outbound queue closed.
        while let Ok(frame) = control.try_recv() {
            let _ = send_frame(&mut ws_sender, &frame).await;
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => match codec::decode::<ChatClientFrame>(&data) {
                    Ok(ChatClientFrame::Send { content }) => {
                        let Err(e) = messenger.deliver(guard.handle(), content).await else {
                            continue;
                        };
                        let notice = e.to_notice();
                        let terminal = notice.is_terminal();
                        let _ = control_tx.try_send(ChatServerFrame::Notice(notice));
                        if terminal {
                            break;
                        }
                    }
                    Ok(ChatClientFrame::Join { .. }) => {
                        tracing::warn!(conversation_id = %conversation_id, "ignoring repeated Join");
                    }
                    Err(e) => {
                        tracing::warn!(conversation_id = %conversation_id, error = %e, "failed to decode client frame");
                    }
                },
                Message::Close(_) => break,
                _ => {
                    // Ignore text, ping, pong frames.
                }
            }
        }
        guard.detach();
    });

    supervise(read_task, write_task).await;
    tracing::info!(conversation_id = %conversation_id, user_id = %user_id, "conversation stream closed");
}

// ---------------------------------------------------------------------------
// Chat-list stream
// ---------------------------------------------------------------------------

async fn chat_list_ws<S: DurableStore, D: Directory>(
    ws: WebSocketUpgrade,
    State(messenger): State<SharedMessenger<S, D>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let claimed = caller_from_headers(&headers);
    ws.on_upgrade(move |socket| handle_chat_list_socket(socket, messenger, claimed))
}

/// Serves one chat-list stream: `Subscribe`, then pushed updates and replies
/// to `StartDirect` requests.
async fn handle_chat_list_socket<S: DurableStore, D: Directory>(
    socket: WebSocket,
    messenger: SharedMessenger<S, D>,
    claimed: Option<UserId>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let user_id = match wait_for_handshake(&mut ws_receiver).await {
        Some(ChatListClientFrame::Subscribe { user_id })
            if !user_id.is_empty() && claimed.as_ref().is_none_or(|c| *c == user_id) =>
        {
            user_id
        }
        _ => {
            tracing::warn!("chat-list stream closed before a valid Subscribe");
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    let subscription = messenger.subscribe_chat_list(&user_id);
    let guard = messenger.chat_list_guard(user_id.clone(), subscription.id);
    let ack = ChatListServerFrame::Subscribed {
        user_id: user_id.clone(),
    };
    if let Err(e) = send_frame(&mut ws_sender, &ack).await {
        tracing::warn!(user_id = %user_id, error = %e, "failed to send Subscribed");
        return;
    }

    let (control_tx, control_rx) = mpsc::channel::<ChatListUpdate>(CONTROL_QUEUE_SIZE);

    let writer_user = user_id.clone();
    let write_task = tokio::spawn(async move {
        let mut control = control_rx;
        let mut updates = subscription.updates;
        loop {
            let update = tokio::select! {
                biased;
                Some(update) = control.recv() => update,
                update = updates.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };
            if let Err(e) = send_frame(&mut ws_sender, &ChatListServerFrame::Update(update)).await {
                tracing::warn!(user_id = %writer_user, error = %e, "WebSocket write failed");
                return;
            }
        }
        while let Ok(update) = control.try_recv() {
            let _ = send_frame(&mut ws_sender, &ChatListServerFrame::Update(update)).await;
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let read_task = tokio::spawn(async move {
        let user_id = guard.user_id().clone();
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => match codec::decode::<ChatListClientFrame>(&data) {
                    Ok(ChatListClientFrame::StartDirect { counterpart_id }) => {
                        let reply = match messenger.start_direct(&user_id, &counterpart_id).await {
                            Ok(update) => update,
                            Err(e) => {
                                tracing::warn!(user_id = %user_id, counterpart_id = %counterpart_id, error = %e, "start direct failed");
                                ChatListUpdate::no_data()
                            }
                        };
                        let _ = control_tx.try_send(reply);
                    }
                    Ok(ChatListClientFrame::Subscribe { .. }) => {
                        tracing::warn!(user_id = %user_id, "ignoring repeated Subscribe");
                    }
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, error = %e, "failed to decode chat-list frame");
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        drop(guard);
    });

    supervise(read_task, write_task).await;
    tracing::info!(user_id = %user_id, "chat-list stream closed");
}

// ---------------------------------------------------------------------------
// Socket helpers
// ---------------------------------------------------------------------------

/// Waits for the first binary frame and decodes it as the handshake.
///
/// Returns `None` on timeout, close, or an undecodable frame.
async fn wait_for_handshake<T: DeserializeOwned>(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<T> {
    let first = async {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    return codec::decode::<T>(&data)
                        .map_err(|e| tracing::warn!(error = %e, "failed to decode handshake"))
                        .ok();
                }
                Message::Close(_) => return None,
                _ => {
                    // Skip non-binary frames (ping/pong) during the handshake.
                }
            }
        }
        None
    };
    tokio::time::timeout(HANDSHAKE_TIMEOUT, first)
        .await
        .ok()
        .flatten()
}

/// Waits for the reader; gives the writer a grace period once the reader is
/// done, and aborts the reader if the writer ends first.
async fn supervise(mut read_task: JoinHandle<()>, mut write_task: JoinHandle<()>) {
    tokio::select! {
        _ = &mut read_task => {
            if tokio::time::timeout(WRITER_GRACE, &mut write_task).await.is_err() {
                write_task.abort();
            }
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }
}

/// Sends a final frame followed by a close frame.
async fn reject<T: Serialize>(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    frame: &T,
) {
    let _ = send_frame(ws_sender, frame).await;
    let _ = ws_sender.send(Message::Close(None)).await;
}

/// Encodes and sends a frame directly on a WebSocket sender.
async fn send_frame<T: Serialize>(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    frame: &T,
) -> Result<(), String> {
    let bytes = codec::encode(frame).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}
