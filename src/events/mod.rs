//! Event bus: in-process fan-out of domain events with a `buffer`/`flush`
//! discipline so listeners observe batched, consistent snapshots (spec.md
//! §4.J). Generalizes an ad hoc `Vec<EventHandler>` + `dispatch_event`
//! pair into an explicit bus type used by the Connection Supervisor,
//! Receiver Pipeline, and pairing flows alike.

use crate::types::Jid;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Events emitted by [Client](crate::Client) to registered handlers,
/// covering both the original connection/pairing events and the full
/// list from spec.md §6.4.
#[derive(Clone, Debug)]
pub enum Event {
    /// QR codes for pairing. Show as QR one by one (first ~60s, others ~20s).
    Qr { codes: Vec<String> },

    /// Pairing completed after scanning QR.
    PairSuccess {
        id: Jid,
        lid: Jid,
        business_name: String,
        platform: String,
    },

    /// Pairing failed after pair-success from server.
    PairError {
        id: Jid,
        lid: Jid,
        business_name: String,
        platform: String,
        error: String,
    },

    /// QR scanned but phone didn't have multidevice enabled.
    QrScannedWithoutMultidevice,

    /// `connection.update`: connection state transition, optionally
    /// carrying a fresh QR string or the last disconnect reason.
    ConnectionUpdate {
        connection: ConnectionState,
        last_disconnect: Option<String>,
        qr: Option<String>,
        received_pending_notifications: Option<bool>,
    },

    /// Client connected and authenticated (kept for existing simple
    /// subscribers; a `ConnectionUpdate{connection: Open, ..}` always
    /// accompanies it).
    Connected,

    /// `creds.update`: credentials changed and must be persisted.
    CredsUpdate,

    /// Keepalive pings timing out.
    KeepAliveTimeout {
        error_count: u32,
        last_success: Option<std::time::SystemTime>,
    },

    /// Keepalive restored after timeouts.
    KeepAliveRestored,

    /// Logged out from another device or connect failure.
    LoggedOut {
        on_connect: bool,
        reason: Option<ConnectFailureReason>,
    },

    /// `auth.clear_required`: the supervisor classified the disconnect as
    /// requiring the application to wipe credentials before reconnecting
    /// (spec.md §4.I, §7).
    AuthClearRequired { code: i32, reason: String },

    /// Another client connected with same keys (stream replaced).
    StreamReplaced,

    /// Temporary ban.
    TemporaryBan {
        code: TempBanReason,
        expire: Duration,
    },

    /// Disconnected (transient).
    Disconnected { reason: String },

    /// `messages.upsert`: one or more inbound messages, `append` for
    /// offline-batch delivery and `notify` for live traffic (spec.md §4.G).
    MessagesUpsert {
        messages: Vec<MessageEvent>,
        mode: UpsertMode,
    },

    /// `messages.update`: server-side edits/deletions to prior messages.
    MessagesUpdate { ids: Vec<crate::types::MessageId> },

    /// `message-receipt.update`: delivery/read status changes.
    MessageReceiptUpdate(ReceiptEvent),

    /// `messaging-history.set`: an offline-history chunk landed.
    MessagingHistorySet { chunk_order: u32, progress: u32 },

    /// `chats.upsert` / `chats.update` / `chats.delete`.
    ChatsUpsert { jids: Vec<Jid> },
    ChatsUpdate { jids: Vec<Jid> },
    ChatsDelete { jids: Vec<Jid> },

    /// `contacts.upsert` / `contacts.update`.
    ContactsUpsert { jids: Vec<Jid> },
    ContactsUpdate { jids: Vec<Jid> },

    /// `groups.upsert` / `groups.update` / `group-participants.update`.
    GroupsUpsert { jids: Vec<Jid> },
    GroupsUpdate { jids: Vec<Jid> },
    GroupParticipantsUpdate { group: Jid, participants: Vec<Jid> },

    /// `blocklist.update`.
    BlocklistUpdate { blocked: Vec<Jid>, unblocked: Vec<Jid> },

    /// `call`: offer/accept/reject/timeout, carrying the cached snapshot
    /// context (spec.md §3 call offer cache).
    Call(CallEvent),

    /// History sync notification, kept as a simpler compatibility event;
    /// superseded by `MessagingHistorySet` for new code.
    HistorySync { chunk_order: u32, progress: u32 },

    /// App state update.
    AppStateSync,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertMode {
    Append,
    Notify,
}

#[derive(Clone, Debug)]
pub struct MessageEvent {
    pub from: Jid,
    pub to: Jid,
    pub id: crate::types::MessageId,
    pub timestamp: std::time::SystemTime,
    pub is_group: bool,
    pub is_from_me: bool,
    /// Raw message payload (protobuf) - decode per message type.
    pub raw: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct ReceiptEvent {
    pub from: Jid,
    pub id: crate::types::MessageId,
    pub timestamp: std::time::SystemTime,
    pub kind: ReceiptKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiptKind {
    Delivered,
    Read,
    ReadSelf,
    Played,
    Retry,
    Sender,
    Inactive,
    PeerMsg,
    HistSync,
}

#[derive(Clone, Debug)]
pub struct CallEvent {
    pub call_id: String,
    pub from: Jid,
    pub is_video: bool,
    pub is_group: bool,
    pub kind: CallEventKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallEventKind {
    Offer,
    Accept,
    Reject,
    Timeout,
}

/// Connect failure reason. Re-exported from [`crate::error`] rather than
/// redefined here — one `ConnectFailureReason`, used both as an `Error`
/// variant payload and as an `Event::LoggedOut` field.
pub use crate::error::ConnectFailureReason;

impl ConnectFailureReason {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            400 => Some(Self::Generic),
            401 => Some(Self::LoggedOut),
            402 => Some(Self::TempBanned),
            403 => Some(Self::MainDeviceGone),
            405 => Some(Self::ClientOutdated),
            406 => Some(Self::UnknownLogout),
            409 => Some(Self::BadUserAgent),
            413 => Some(Self::CATExpired),
            414 => Some(Self::CATInvalid),
            415 => Some(Self::NotFound),
            418 => Some(Self::ClientUnknown),
            500 => Some(Self::InternalServerError),
            501 => Some(Self::Experimental),
            503 => Some(Self::ServiceUnavailable),
            _ => None,
        }
    }

    pub fn is_logged_out(&self) -> bool {
        matches!(
            self,
            Self::LoggedOut | Self::MainDeviceGone | Self::UnknownLogout
        )
    }
}

/// Temporary ban reason.
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TempBanReason {
    SentToTooManyPeople = 101,
    BlockedByUsers = 102,
    CreatedTooManyGroups = 103,
    SentTooManySameMessage = 104,
    BroadcastList = 106,
}

type EventHandler = Box<dyn Fn(Event) + Send + Sync>;
/// Diagnostics sink for handler panics and background-task errors
/// (spec.md §6.2 `onUnexpectedError`; §9 "global singletons -> injected
/// collaborators").
pub type UnexpectedErrorSink = Arc<dyn Fn(String, String) + Send + Sync>;

fn default_error_sink() -> UnexpectedErrorSink {
    Arc::new(|err, context| tracing::error!(%err, %context, "unexpected error"))
}

/// In-process event emitter with `buffer`/`flush` framing.
pub struct EventBus {
    handlers: RwLock<Vec<EventHandler>>,
    frame: Mutex<Option<Vec<Event>>>,
    on_unexpected_error: UnexpectedErrorSink,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            frame: Mutex::new(None),
            on_unexpected_error: default_error_sink(),
        }
    }

    pub fn with_error_sink(sink: UnexpectedErrorSink) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            frame: Mutex::new(None),
            on_unexpected_error: sink,
        }
    }

    pub async fn subscribe<F>(&self, f: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.handlers.write().await.push(Box::new(f));
    }

    /// Opens a frame: subsequent `emit`s are queued instead of dispatched.
    pub async fn buffer(&self) {
        let mut frame = self.frame.lock().await;
        *frame = Some(Vec::new());
    }

    /// Replays queued emits in order, then closes the frame. A no-op if no
    /// frame is open.
    pub async fn flush(&self) {
        let queued = self.frame.lock().await.take();
        if let Some(queued) = queued {
            for evt in queued {
                self.dispatch(evt).await;
            }
        }
    }

    /// Emits an event: queued if a frame is open, dispatched immediately
    /// otherwise.
    pub async fn emit(&self, evt: Event) {
        let mut frame = self.frame.lock().await;
        match frame.as_mut() {
            Some(queue) => queue.push(evt),
            None => {
                drop(frame);
                self.dispatch(evt).await;
            }
        }
    }

    /// Runs every subscriber synchronously, in registration order. A
    /// panicking handler is caught and reported via the injected
    /// `on_unexpected_error` collaborator rather than aborting the frame
    /// (spec.md §4.J).
    async fn dispatch(&self, evt: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            let evt_clone = evt.clone();
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(evt_clone)));
            if let Err(panic) = result {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                (self.on_unexpected_error)(message, "event handler".to_string());
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn immediate_emit_dispatches_synchronously() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        bus.emit(Event::Connected).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn buffered_emits_dispatch_in_order_on_flush() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = Arc::clone(&order);
        bus.subscribe(move |evt| {
            if let Event::MessagingHistorySet { chunk_order, .. } = evt {
                let order_clone = Arc::clone(&order_clone);
                tokio::spawn(async move {
                    order_clone.lock().await.push(chunk_order);
                });
            }
        })
        .await;

        bus.buffer().await;
        bus.emit(Event::MessagingHistorySet { chunk_order: 1, progress: 10 }).await;
        bus.emit(Event::MessagingHistorySet { chunk_order: 2, progress: 20 }).await;
        // Not dispatched yet: frame is open.
        bus.flush().await;
        tokio::task::yield_now().await;
        assert_eq!(*order.lock().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_abort_frame() {
        let bus = EventBus::new();
        let reported = Arc::new(AtomicUsize::new(0));
        let reported_clone = Arc::clone(&reported);
        let bus = EventBus::with_error_sink(Arc::new(move |_, _| {
            reported_clone.fetch_add(1, Ordering::SeqCst);
        }));
        bus.subscribe(|_| panic!("boom")).await;
        let second_ran = Arc::new(AtomicUsize::new(0));
        let second_ran_clone = Arc::clone(&second_ran);
        bus.subscribe(move |_| {
            second_ran_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        bus.emit(Event::Connected).await;
        assert_eq!(reported.load(Ordering::SeqCst), 1);
        assert_eq!(second_ran.load(Ordering::SeqCst), 1);
    }
}
