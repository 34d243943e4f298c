use crate::error::AppError;
use crate::market::collaborators::QueryCacheInvalidator;
use crate::market::dispatcher::EventDispatcher;
use crate::market::subscriptions::SubscriptionRegistry;
use crate::market::types::{
    parse_inbound_payload, ConnectionState, InboundMessage, OutboundMessage, StreamConfig,
    StreamStatusSnapshot,
};
use crate::state::{StatusStore, ViewHandle};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type StreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<StreamSocket, Message>;

#[derive(Clone, Default)]
pub struct OutboundLink {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<OutboundMessage>>>>,
}

impl OutboundLink {
    pub(crate) fn attach(&self, sender: mpsc::UnboundedSender<OutboundMessage>) {
        *self.sender.lock() = Some(sender);
    }

    pub(crate) fn detach(&self) {
        self.sender.lock().take();
    }

    pub fn is_open(&self) -> bool {
        self.sender
            .lock()
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    /// Queues `message` on the open socket. Returns `false` when closed.
    pub fn send(&self, message: OutboundMessage) -> bool {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct StreamTelemetry {
    messages_received: AtomicU64,
    decode_failures: AtomicU64,
    reconnects: AtomicU64,
    has_last_message_at_ms: AtomicBool,
    last_message_at_ms: AtomicI64,
}

impl StreamTelemetry {
    fn record_message(&self, received_at_ms: i64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_message_at_ms
            .store(received_at_ms, Ordering::Relaxed);
        self.has_last_message_at_ms.store(true, Ordering::Relaxed);
    }

    fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn last_message_at_ms(&self) -> Option<i64> {
        if self.has_last_message_at_ms.load(Ordering::Relaxed) {
            Some(self.last_message_at_ms.load(Ordering::Relaxed))
        } else {
            None
        }
    }
}

#[derive(Clone)]
pub struct ConnectionContext {
    pub config: StreamConfig,
    pub registry: Arc<Mutex<SubscriptionRegistry>>,
    pub dispatcher: Arc<EventDispatcher>,
    pub views: ViewHandle,
    pub outbound: OutboundLink,
    pub cache: Arc<dyn QueryCacheInvalidator>,
    pub status_store: StatusStore,
    pub telemetry: Arc<StreamTelemetry>,
}

enum SocketExit {
    Cancelled,
    Closed(String),
}

enum FrameOutcome {
    Continue,
    Close,
}

pub async fn connect_stream(endpoint_url: &str) -> Result<StreamSocket, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(endpoint_url, Some(ws_config), true).await?;
    Ok(stream)
}

pub async fn run_stream_connection(context: ConnectionContext, cancel_token: CancellationToken) {
    let delay = Duration::from_millis(context.config.reconnect_delay_ms);
    let mut reconnect_attempt = 0_u32;

    while !cancel_token.is_cancelled() {
        let (phase, reason) = if reconnect_attempt == 0 {
            (ConnectionState::Connecting, "opening websocket stream".to_string())
        } else {
            (
                ConnectionState::Reconnecting,
                format!("reconnect attempt {reconnect_attempt}"),
            )
        };
        publish_status(&context, phase, reconnect_attempt, Some(reason)).await;

        let connected = tokio::select! {
            _ = cancel_token.cancelled() => break,
            result = connect_stream(&context.config.endpoint_url) => result,
        };

        match connected {
            Ok(socket) => {
                reconnect_attempt = 0;
                info!(endpoint = %context.config.endpoint_url, "websocket connected");
                publish_status(
                    &context,
                    ConnectionState::Live,
                    0,
                    Some("websocket connected".to_string()),
                )
                .await;

                match drive_socket(socket, &context, &cancel_token).await {
                    SocketExit::Cancelled => break,
                    SocketExit::Closed(reason) => {
                        warn!(%reason, "websocket closed");
                        publish_status(&context, ConnectionState::Reconnecting, 0, Some(reason))
                            .await;
                    }
                }
            }
            Err(error) => {
                warn!(%error, attempt = reconnect_attempt, "websocket connect failed");
                publish_status(
                    &context,
                    ConnectionState::Error,
                    reconnect_attempt,
                    Some(format!("websocket connect error: {error}")),
                )
                .await;
            }
        }

        reconnect_attempt = reconnect_attempt.saturating_add(1);
        context.telemetry.record_reconnect();
        info!(
            delay_ms = context.config.reconnect_delay_ms,
            attempt = reconnect_attempt,
            "scheduling reconnect"
        );
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    context.outbound.detach();
    publish_status(
        &context,
        ConnectionState::Stopped,
        0,
        Some("stream stopped".to_string()),
    )
    .await;
    info!("stream connection stopped");
}

async fn drive_socket(
    socket: StreamSocket,
    context: &ConnectionContext,
    cancel_token: &CancellationToken,
) -> SocketExit {
    let (mut sink, mut frames) = socket.split();
    let (sender, mut outbound) = mpsc::unbounded_channel();

    // Attaching under the registry lock means every later registry change is
    // either part of this replay or arrives through the channel.
    let replay = {
        let registry = context.registry.lock();
        context.outbound.attach(sender);
        registry.replay_messages()
    };
    for message in &replay {
        if let Err(error) = send_outbound(&mut sink, message).await {
            context.outbound.detach();
            return SocketExit::Closed(format!("subscription replay failed: {error}"));
        }
    }
    info!(requests = replay.len(), "replayed subscriptions");

    let exit = loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                if let Err(error) = sink.send(Message::Close(None)).await {
                    debug!(%error, "failed to send close frame");
                }
                break SocketExit::Cancelled;
            }
            Some(message) = outbound.recv() => {
                if let Err(error) = send_outbound(&mut sink, &message).await {
                    break SocketExit::Closed(format!("websocket send error: {error}"));
                }
            }
            frame = frames.next() => match frame {
                None => break SocketExit::Closed("websocket stream ended".to_string()),
                Some(Err(error)) => {
                    break SocketExit::Closed(format!("websocket frame error: {error}"));
                }
                Some(Ok(message)) => {
                    if let FrameOutcome::Close = handle_frame(message, context) {
                        break SocketExit::Closed("server closed the connection".to_string());
                    }
                }
            },
        }
    };

    context.outbound.detach();
    exit
}

async fn send_outbound(sink: &mut SocketSink, message: &OutboundMessage) -> Result<(), AppError> {
    let payload = message.encode()?;
    debug!(%payload, "sending subscription request");
    sink.send(Message::Text(payload)).await?;
    Ok(())
}

fn handle_frame(message: Message, context: &ConnectionContext) -> FrameOutcome {
    let mut payload = match message {
        Message::Text(text) => text.into_bytes(),
        Message::Binary(bytes) => bytes,
        Message::Close(frame) => {
            debug!(?frame, "received close frame");
            return FrameOutcome::Close;
        }
        _ => return FrameOutcome::Continue,
    };

    context.telemetry.record_message(now_unix_ms());
    match parse_inbound_payload(payload.as_mut_slice()) {
        Ok(message) => route_message(message, context),
        Err(AppError::UnknownMessageType(kind)) => {
            warn!(%kind, "ignoring message with unknown type");
        }
        Err(error) => {
            context.telemetry.record_decode_failure();
            warn!(%error, "failed to decode inbound frame");
        }
    }
    FrameOutcome::Continue
}

fn route_message(message: InboundMessage, context: &ConnectionContext) {
    if let InboundMessage::Updates(updates) = &message {
        let mut touched = HashSet::with_capacity(updates.len());
        for update in updates {
            let pool_id = update.pool().id.as_str();
            if touched.insert(pool_id) {
                context.cache.invalidate_pool(pool_id);
            }
        }
    }

    let tag = message.tag();
    let delivered = context.dispatcher.dispatch(&context.views, message);
    debug!(tag = tag.as_str(), delivered, "dispatched inbound message");
}

async fn publish_status(
    context: &ConnectionContext,
    state: ConnectionState,
    reconnect_attempt: u32,
    reason: Option<String>,
) {
    let telemetry = &context.telemetry;
    let snapshot = StreamStatusSnapshot {
        state,
        endpoint_url: context.config.endpoint_url.clone(),
        reconnect_attempt,
        messages_received: telemetry.messages_received(),
        decode_failures: telemetry.decode_failures(),
        reconnects: telemetry.reconnects(),
        last_message_at_ms: telemetry.last_message_at_ms(),
        reason,
    };

    let mut writable = context.status_store.write().await;
    *writable = snapshot;
}

fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
