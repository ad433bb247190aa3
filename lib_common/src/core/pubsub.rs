//! # PostgreSQL LISTEN/NOTIFY Pub/Sub Channel
//!
//! Cross-process event broadcasting for a fleet of worker processes that
//! share nothing but the relational store. A `NOTIFY` issued by any worker is
//! delivered by PostgreSQL to every worker currently listening on the channel
//! (including the publisher itself), and each worker then invokes its locally
//! registered handlers.
//!
//! ## Design:
//!
//! 1.  **One connection per process.** The dedicated LISTEN/NOTIFY connection
//!     is cached behind an async mutex; `publish` and listener setup never
//!     race on connection replacement.
//!
//! 2.  **Best-effort publish.** `publish` never errors to its caller: any
//!     failure is logged and the cached connection is invalidated so the next
//!     call re-establishes it. A payload larger than the NOTIFY limit is
//!     replaced by a minimal `{kind, id}` fallback so receivers can still
//!     decide to re-fetch state instead of missing the event.
//!
//! 3.  **Self-healing listener.** A keepalive task exercises the connection
//!     every 30 seconds; on failure it tears the connection down and
//!     re-establishes it (re-issuing `LISTEN`), without dropping registered
//!     handlers. `stop_listening` cancels the keepalive and releases the
//!     connection, leaving no background activity behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, NoTls};
use tokio_util::sync::CancellationToken;

use crate::models::BroadcastEvent;

/// Errors surfaced when starting the listener. Publishing is best-effort and
/// never returns an error; only listener startup is fallible.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("Failed to connect to the notification channel: {0}")]
    Connect(tokio_postgres::Error),
    #[error("LISTEN command failed: {0}")]
    Listen(tokio_postgres::Error),
}

/// The fixed notification channel shared by all workers.
pub const CHANNEL_NAME: &str = "sse_events";

/// PostgreSQL caps NOTIFY payloads at ~8000 bytes; stay safely under it.
pub const MAX_NOTIFY_BYTES: usize = 7500;

/// How often the listener connection is exercised.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// A local callback invoked for every event received on the channel,
/// regardless of which process published it. Handlers run synchronously in
/// registration order; they cannot fail and must not block.
pub trait EventHandler: Send + Sync {
    /// Called once per received event.
    fn handle(&self, event: &BroadcastEvent);
}

type HandlerList = Arc<StdMutex<Vec<Arc<dyn EventHandler>>>>;

/// Encodes an event for `NOTIFY`, truncating to `{kind, id}` when the full
/// JSON encoding exceeds [`MAX_NOTIFY_BYTES`].
pub fn encode_notify_payload(event: &BroadcastEvent) -> String {
    let full = event.to_json();
    if full.len() > MAX_NOTIFY_BYTES {
        warn!("Pub/sub message truncated due to size ({} bytes)", full.len());
        serde_json::json!({ "kind": event.kind, "id": event.id }).to_string()
    } else {
        full
    }
}

/// # Pub/Sub Channel
///
/// Owns the per-process notification connection and the handler registry.
/// Constructed once at startup and shared via `Arc`.
pub struct PubSub {
    /// PostgreSQL connection string.
    db_url: String,
    /// The notification channel name (fixed per deployment).
    channel: String,
    /// The cached connection, replaced on failure. Exactly one per process.
    client: AsyncMutex<Option<Arc<Client>>>,
    /// Locally registered handlers; preserved across reconnects.
    handlers: HandlerList,
    /// Whether `LISTEN` should be (re-)issued on every fresh connection.
    listening: AtomicBool,
    /// The keepalive task, present while listening.
    keepalive: StdMutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PubSub {
    /// Creates a channel on the default [`CHANNEL_NAME`].
    pub fn new(db_url: impl Into<String>) -> Self {
        Self::with_channel(db_url, CHANNEL_NAME)
    }

    /// Creates a channel with an explicit channel name.
    pub fn with_channel(db_url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            db_url: db_url.into(),
            channel: channel.into(),
            client: AsyncMutex::new(None),
            handlers: Arc::new(StdMutex::new(Vec::new())),
            listening: AtomicBool::new(false),
            keepalive: StdMutex::new(None),
        }
    }

    /// Registers a handler invoked for every received event. Idempotent:
    /// registering the same handler twice has no additional effect.
    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.lock().expect("PubSub handler lock poisoned");
        if handlers.iter().any(|existing| Arc::ptr_eq(existing, &handler)) {
            return;
        }
        handlers.push(handler);
        info!("Registered pub/sub handler ({} total)", handlers.len());
    }

    /// # Publish
    ///
    /// Broadcasts `event` to all workers via `pg_notify`. Best-effort: on any
    /// failure the error is logged, the cached connection is invalidated so
    /// the next call reconnects, and the call returns normally.
    pub async fn publish(&self, event: &BroadcastEvent) {
        let message = encode_notify_payload(event);

        let client = match self.connect().await {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to publish to pub/sub: {}", e);
                return;
            }
        };

        if let Err(e) = client
            .execute("SELECT pg_notify($1, $2)", &[&self.channel, &message])
            .await
        {
            error!("Failed to publish to pub/sub: {}", e);
            self.invalidate().await;
        }
    }

    /// # Start Listening
    ///
    /// Issues `LISTEN` on the shared connection and spawns the keepalive
    /// task. Safe to call when already listening.
    pub async fn start_listening(self: &Arc<Self>) -> Result<(), ListenError> {
        {
            let guard = self.keepalive.lock().expect("PubSub keepalive lock poisoned");
            if guard.is_some() {
                info!("Pub/sub listener already running");
                return Ok(());
            }
        }

        let client = self.connect().await.map_err(ListenError::Connect)?;
        client
            .batch_execute(&format!("LISTEN {}", self.channel))
            .await
            .map_err(ListenError::Listen)?;
        // Set only after LISTEN succeeded; reconnects re-issue it themselves.
        self.listening.store(true, Ordering::SeqCst);
        info!("Started listening on channel: {}", self.channel);

        let token = CancellationToken::new();
        let child = token.clone();
        let pubsub = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {
                        if let Err(e) = pubsub.keepalive_tick().await {
                            warn!("Pub/sub keepalive error: {}", e);
                            if let Err(e) = pubsub.reconnect().await {
                                error!("Pub/sub reconnect failed: {}", e);
                            }
                        }
                    }
                }
            }
        });

        let mut guard = self.keepalive.lock().expect("PubSub keepalive lock poisoned");
        *guard = Some((token, handle));
        Ok(())
    }

    /// # Stop Listening
    ///
    /// Cancels the keepalive task and releases the connection. Guaranteed to
    /// leave no lingering background activity: the message-pump tasks end as
    /// soon as the client handle is dropped.
    pub async fn stop_listening(&self) {
        let entry = {
            let mut guard = self.keepalive.lock().expect("PubSub keepalive lock poisoned");
            guard.take()
        };
        if let Some((token, handle)) = entry {
            token.cancel();
            let _ = handle.await;
            info!("Stopped pub/sub keepalive task");
        }

        self.listening.store(false, Ordering::SeqCst);

        let client = self.client.lock().await.take();
        if let Some(client) = client {
            let _ = client
                .batch_execute(&format!("UNLISTEN {}", self.channel))
                .await;
            info!("Closed pub/sub connection");
        }
    }

    /// Returns the cached connection, establishing a fresh one (and
    /// re-issuing `LISTEN` when the listener is active) if the cache is
    /// empty or the connection has died.
    async fn connect(&self) -> Result<Arc<Client>, tokio_postgres::Error> {
        let mut guard = self.client.lock().await;
        if let Some(existing) = guard.as_ref() {
            if !existing.is_closed() {
                return Ok(Arc::clone(existing));
            }
        }

        let (client, mut connection) = tokio_postgres::connect(&self.db_url, NoTls).await?;

        // The Connection must be polled to make progress, and it is the only
        // source of AsyncMessage notifications. Pump its messages into an
        // unbounded pipe consumed by the dispatch task below.
        let (tx, mut rx) = futures_channel::mpsc::unbounded();
        tokio::spawn(async move {
            let mut messages =
                futures_util::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(result) = messages.next().await {
                match result {
                    Ok(message) => {
                        if tx.unbounded_send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Pub/sub connection error: {}", e);
                        break;
                    }
                }
            }
        });

        let handlers = Arc::clone(&self.handlers);
        let channel = self.channel.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.next().await {
                if let AsyncMessage::Notification(note) = message {
                    if note.channel() == channel {
                        dispatch_raw(&handlers, note.payload());
                    }
                }
            }
            debug!("Pub/sub message pump finished");
        });

        let client = Arc::new(client);
        if self.listening.load(Ordering::SeqCst) {
            client
                .batch_execute(&format!("LISTEN {}", self.channel))
                .await?;
        }
        *guard = Some(Arc::clone(&client));
        info!("Created new PostgreSQL connection for pub/sub");
        Ok(client)
    }

    /// Exercises the connection so a silent drop is detected promptly.
    async fn keepalive_tick(&self) -> Result<(), tokio_postgres::Error> {
        let client = self.connect().await?;
        client.execute("SELECT 1", &[]).await?;
        Ok(())
    }

    /// Drops the cached connection and establishes a fresh one.
    async fn reconnect(&self) -> Result<(), tokio_postgres::Error> {
        self.invalidate().await;
        self.connect().await?;
        info!("Reconnected pub/sub listener");
        Ok(())
    }

    /// Forgets the cached connection; the next use re-establishes it.
    async fn invalidate(&self) {
        *self.client.lock().await = None;
    }
}

/// Decodes one inbound notification payload and fans it out to the handler
/// snapshot. A malformed payload is logged and dropped without affecting
/// other notifications.
fn dispatch_raw(handlers: &HandlerList, payload: &str) {
    match serde_json::from_str::<BroadcastEvent>(payload) {
        Ok(event) => {
            let snapshot: Vec<Arc<dyn EventHandler>> = {
                let guard = handlers.lock().expect("PubSub handler lock poisoned");
                guard.iter().cloned().collect()
            };
            for handler in snapshot {
                handler.handle(&event);
            }
        }
        Err(e) => error!("Failed to decode pub/sub message: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct Recorder {
        kinds: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                kinds: Mutex::new(Vec::new()),
            })
        }
    }

    impl EventHandler for Recorder {
        fn handle(&self, event: &BroadcastEvent) {
            self.kinds.lock().unwrap().push(event.kind.clone());
        }
    }

    #[test]
    fn oversized_payload_is_truncated_to_kind_and_id() {
        let id = Uuid::new_v4();
        let event = BroadcastEvent::new("reminder.due", Some(id), None).with_field(
            "blob",
            serde_json::json!("x".repeat(MAX_NOTIFY_BYTES + 100)),
        );

        let wire = encode_notify_payload(&event);
        assert!(wire.len() <= MAX_NOTIFY_BYTES);

        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["kind"], "reminder.due");
        assert_eq!(value["id"], serde_json::json!(id.to_string()));
        assert!(value.get("blob").is_none());
    }

    #[test]
    fn small_payload_is_not_truncated() {
        let event = BroadcastEvent::new("entity.created", Some(Uuid::new_v4()), None)
            .with_field("subject_name", serde_json::json!("Ibuprofen"));
        let wire = encode_notify_payload(&event);
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["subject_name"], "Ibuprofen");
    }

    #[test]
    fn register_handler_is_idempotent() {
        let pubsub = PubSub::new("postgres://unused");
        let recorder = Recorder::new();

        pubsub.register_handler(recorder.clone());
        pubsub.register_handler(recorder.clone());

        assert_eq!(pubsub.handlers.lock().unwrap().len(), 1);

        let other = Recorder::new();
        pubsub.register_handler(other);
        assert_eq!(pubsub.handlers.lock().unwrap().len(), 2);
    }

    #[test]
    fn dispatch_invokes_all_handlers_in_order() {
        let pubsub = PubSub::new("postgres://unused");
        let first = Recorder::new();
        let second = Recorder::new();
        pubsub.register_handler(first.clone());
        pubsub.register_handler(second.clone());

        let event = BroadcastEvent::new("reminder.due", Some(Uuid::new_v4()), None);
        dispatch_raw(&pubsub.handlers, &event.to_json());

        assert_eq!(*first.kinds.lock().unwrap(), vec!["reminder.due"]);
        assert_eq!(*second.kinds.lock().unwrap(), vec!["reminder.due"]);
    }

    #[tokio::test]
    async fn failed_listener_start_leaves_no_listen_state_behind() {
        // Port 1 refuses immediately; no database is involved.
        let pubsub = Arc::new(PubSub::new("postgres://user@127.0.0.1:1/db"));
        assert!(pubsub.start_listening().await.is_err());

        // A failed start must not leave the listen flag set, otherwise the
        // next connection (e.g. for a publish) would issue LISTEN for a
        // listener that never started.
        assert!(!pubsub.listening.load(Ordering::SeqCst));
        assert!(pubsub.keepalive.lock().unwrap().is_none());
    }

    #[test]
    fn malformed_payload_is_dropped() {
        let pubsub = PubSub::new("postgres://unused");
        let recorder = Recorder::new();
        pubsub.register_handler(recorder.clone());

        dispatch_raw(&pubsub.handlers, "{definitely not json");

        assert!(recorder.kinds.lock().unwrap().is_empty());
    }
}
