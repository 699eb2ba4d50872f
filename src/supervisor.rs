//! Connection Supervisor (spec.md §4.I): owns the single-client lifecycle
//! state machine, disconnect classification, and the reconnect backoff
//! policy. Replaces a bare boolean `connected`/`logged_in` pair on `Client`
//! with the explicit `connecting -> handshaking -> open -> closing ->
//! closed` states spec.md names, per the "callback-heavy listeners ->
//! explicit state machines" redesign flag (spec.md §9).

use crate::events::{ConnectionState, Event, EventBus};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How a closed connection should be handled (spec.md §4.I, §7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectClass {
    /// `xmlstreamend` or `stream:error reason=logged-out`: fatal, never
    /// reconnect.
    LoggedOut,
    /// After pair-success: reconnect immediately, reusing creds.
    RestartRequired,
    /// `badSession`/401/403/419/428: the application must wipe credentials
    /// before a reconnect can succeed.
    AuthMustClear,
    /// `408`/`1006`/`503`/`429`/`5xx`: reconnect with backoff.
    Transient,
}

/// Classifies a raw disconnect code/reason per the table in spec.md §4.I.
/// `stream_error_reason` takes precedence when present (it's the more
/// specific signal the server gives on a graceful `stream:error`).
pub fn classify_disconnect(code: Option<u16>, stream_error_reason: Option<&str>) -> DisconnectClass {
    if let Some(reason) = stream_error_reason {
        match reason {
            "logged-out" => return DisconnectClass::LoggedOut,
            "restart-required" => return DisconnectClass::RestartRequired,
            _ => {}
        }
    }
    match code {
        None => DisconnectClass::LoggedOut, // xmlstreamend with no code
        Some(401) | Some(403) | Some(419) | Some(428) => DisconnectClass::AuthMustClear,
        Some(408) | Some(429) | Some(503) | Some(1006) => DisconnectClass::Transient,
        Some(c) if (500..600).contains(&c) => DisconnectClass::Transient,
        Some(_) => DisconnectClass::Transient,
    }
}

/// Base reconnect schedule indexed by (1-based) attempt count, in seconds
/// (spec.md §4.I).
const BASE_SCHEDULE_SECS: [u64; 5] = [2, 4, 8, 16, 30];

/// Per-code multiplier applied on top of the base schedule, plus a floor
/// the result is clamped to (spec.md §4.I).
fn multiplier_and_floor(code: Option<u16>) -> (f64, Duration) {
    match code {
        Some(503) => (2.0, Duration::ZERO),
        Some(429) => (3.0, Duration::ZERO),
        Some(408) => (0.5, Duration::from_secs(1)),
        Some(428) | Some(401) | Some(403) => (1.5, Duration::from_secs(3)),
        Some(405) => (0.8, Duration::from_secs(2)),
        Some(1006) => (1.2, Duration::ZERO),
        _ => (1.0, Duration::ZERO),
    }
}

/// Computes the reconnect delay for the given (1-based) `attempt` and the
/// disconnect `code` that triggered it (spec.md §4.I, §8 testable
/// property). `attempt` is clamped to the schedule's length so repeated
/// failures cap out at the last entry rather than indexing past it.
pub fn reconnect_delay(attempt: u32, code: Option<u16>) -> Duration {
    let index = (attempt.saturating_sub(1) as usize).min(BASE_SCHEDULE_SECS.len() - 1);
    let base = Duration::from_secs(BASE_SCHEDULE_SECS[index]);
    let (multiplier, floor) = multiplier_and_floor(code);
    let scaled = base.mul_f64(multiplier);
    scaled.max(floor)
}

/// Single-client lifecycle owner (spec.md §4.I). Tracks the connection
/// state, whether reconnect is currently permitted, and the attempt
/// counter the backoff schedule indexes by.
pub struct Supervisor {
    state: Mutex<ConnectionState>,
    reconnect_enabled: AtomicBool,
    attempt: AtomicU32,
    max_reconnect_attempts: u32,
    event_bus: Arc<EventBus>,
    clear_auth_on_error: bool,
}

impl Supervisor {
    pub fn new(event_bus: Arc<EventBus>, max_reconnect_attempts: u32) -> Self {
        Self::with_clear_auth_on_error(event_bus, max_reconnect_attempts, true)
    }

    /// `clear_auth_on_error` gates whether a classified-auth disconnect emits
    /// `Event::AuthClearRequired` at all (spec.md §6.3 `clearAuthOnError`).
    pub fn with_clear_auth_on_error(event_bus: Arc<EventBus>, max_reconnect_attempts: u32, clear_auth_on_error: bool) -> Self {
        Self {
            state: Mutex::new(ConnectionState::Closed),
            reconnect_enabled: AtomicBool::new(true),
            attempt: AtomicU32::new(0),
            max_reconnect_attempts,
            event_bus,
            clear_auth_on_error,
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    /// `connect()` re-entry idempotence (spec.md §4.I): concurrent connects
    /// while connecting/open are a no-op. Returns `true` if the caller
    /// should proceed (state was `Closed`/`Closing`), `false` if a connect
    /// or open session is already in flight.
    pub async fn begin_connect(&self) -> bool {
        let mut state = self.state.lock().await;
        if matches!(*state, ConnectionState::Connecting | ConnectionState::Open) {
            return false;
        }
        *state = ConnectionState::Connecting;
        true
    }

    pub async fn mark_handshaking(&self) {
        // Handshaking is a sub-phase of Connecting in the public ConnectionState
        // enum (spec.md §6.4 only exposes connecting/open/close); tracked here
        // only via tracing, not a distinct public state.
        tracing::debug!("supervisor: handshaking");
    }

    /// Transition to `open`, reset the reconnect attempt counter, and emit
    /// `connection.update { connection: open }`.
    pub async fn mark_open(&self) {
        *self.state.lock().await = ConnectionState::Open;
        self.attempt.store(0, Ordering::SeqCst);
        self.event_bus
            .emit(Event::ConnectionUpdate {
                connection: ConnectionState::Open,
                last_disconnect: None,
                qr: None,
                received_pending_notifications: None,
            })
            .await;
    }

    /// Handles a transport close: classifies it, emits the matching event,
    /// and returns the delay the caller should wait before reconnecting —
    /// `None` means "do not reconnect" (spec.md §4.I).
    pub async fn handle_close(&self, code: Option<u16>, stream_error_reason: Option<&str>) -> Option<Duration> {
        *self.state.lock().await = ConnectionState::Closed;
        let class = classify_disconnect(code, stream_error_reason);

        self.event_bus
            .emit(Event::ConnectionUpdate {
                connection: ConnectionState::Closed,
                last_disconnect: Some(format!("{:?} (code={:?})", class, code)),
                qr: None,
                received_pending_notifications: None,
            })
            .await;

        match class {
            DisconnectClass::LoggedOut => {
                self.reconnect_enabled.store(false, Ordering::SeqCst);
                self.event_bus
                    .emit(Event::LoggedOut { on_connect: false, reason: None })
                    .await;
                None
            }
            DisconnectClass::AuthMustClear => {
                if self.clear_auth_on_error {
                    self.event_bus
                        .emit(Event::AuthClearRequired {
                            code: code.map(|c| c as i32).unwrap_or(-1),
                            reason: "classified auth-must-clear disconnect".to_string(),
                        })
                        .await;
                }
                self.next_reconnect_delay(code).await
            }
            DisconnectClass::RestartRequired => {
                self.attempt.store(0, Ordering::SeqCst);
                Some(Duration::ZERO)
            }
            DisconnectClass::Transient => self.next_reconnect_delay(code).await,
        }
    }

    async fn next_reconnect_delay(&self, code: Option<u16>) -> Option<Duration> {
        if !self.reconnect_enabled.load(Ordering::SeqCst) {
            return None;
        }
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.max_reconnect_attempts {
            self.event_bus
                .emit(Event::Disconnected {
                    reason: "max reconnect attempts reached".to_string(),
                })
                .await;
            return None;
        }
        Some(reconnect_delay(attempt, code))
    }

    /// Manual `close()`: disables reconnect for good (spec.md §4.I, §5).
    pub async fn manual_close(&self) {
        self.reconnect_enabled.store(false, Ordering::SeqCst);
        *self.state.lock().await = ConnectionState::Closing;
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.reconnect_enabled.load(Ordering::SeqCst)
    }

    /// Re-arms reconnect after a manual close or a fresh `connect()` call
    /// (e.g. after the application supplies fresh credentials post
    /// `auth.clear_required`).
    pub fn re_enable_reconnect(&self) {
        self.reconnect_enabled.store(true, Ordering::SeqCst);
        self.attempt.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_logged_out() {
        assert_eq!(classify_disconnect(None, Some("logged-out")), DisconnectClass::LoggedOut);
        assert_eq!(classify_disconnect(None, None), DisconnectClass::LoggedOut);
    }

    #[test]
    fn classify_restart_required() {
        assert_eq!(
            classify_disconnect(Some(200), Some("restart-required")),
            DisconnectClass::RestartRequired
        );
    }

    #[test]
    fn classify_auth_must_clear_codes() {
        for code in [401, 403, 419, 428] {
            assert_eq!(classify_disconnect(Some(code), None), DisconnectClass::AuthMustClear);
        }
    }

    #[test]
    fn classify_transient_codes() {
        for code in [408, 429, 503, 1006, 500] {
            assert_eq!(classify_disconnect(Some(code), None), DisconnectClass::Transient);
        }
    }

    #[test]
    fn reconnect_delay_503_doubles() {
        // attempt=2 -> base 4s * 2 = 8s (spec.md §8 testable property).
        assert_eq!(reconnect_delay(2, Some(503)), Duration::from_secs(8));
    }

    #[test]
    fn reconnect_delay_408_halves_with_floor() {
        // attempt=1 -> base 2s * 0.5 = 1s, floored at 1s either way.
        assert_eq!(reconnect_delay(1, Some(408)), Duration::from_secs(1));
    }

    #[test]
    fn reconnect_delay_caps_at_schedule_length() {
        let at_cap = reconnect_delay(5, None);
        let past_cap = reconnect_delay(50, None);
        assert_eq!(at_cap, past_cap);
    }

    #[tokio::test]
    async fn logged_out_disables_reconnect_permanently() {
        let bus = Arc::new(EventBus::new());
        let sup = Supervisor::new(bus, 5);
        let delay = sup.handle_close(None, Some("logged-out")).await;
        assert!(delay.is_none());
        assert!(!sup.reconnect_enabled());
    }

    #[tokio::test]
    async fn max_reconnect_attempts_stops_retrying() {
        let bus = Arc::new(EventBus::new());
        let sup = Supervisor::new(bus, 2);
        assert!(sup.handle_close(Some(503), None).await.is_some());
        assert!(sup.handle_close(Some(503), None).await.is_some());
        assert!(sup.handle_close(Some(503), None).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_connect_is_idempotent() {
        let bus = Arc::new(EventBus::new());
        let sup = Supervisor::new(bus, 5);
        assert!(sup.begin_connect().await);
        assert!(!sup.begin_connect().await, "already connecting");
        sup.mark_open().await;
        assert!(!sup.begin_connect().await, "already open");
    }

    #[tokio::test]
    async fn clear_auth_on_error_false_suppresses_event() {
        let bus = Arc::new(EventBus::new());
        let received = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&received);
        bus.subscribe(move |evt| {
            if matches!(evt, Event::AuthClearRequired { .. }) {
                flag.store(true, Ordering::SeqCst);
            }
        })
        .await;
        let sup = Supervisor::with_clear_auth_on_error(bus, 5, false);
        sup.handle_close(Some(401), None).await;
        assert!(!received.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn mark_open_resets_attempt_counter() {
        let bus = Arc::new(EventBus::new());
        let sup = Supervisor::new(bus, 5);
        sup.handle_close(Some(503), None).await;
        sup.mark_open().await;
        // After a fresh open, the next close should restart at attempt=1.
        let delay = sup.handle_close(Some(503), None).await;
        assert_eq!(delay, Some(reconnect_delay(1, Some(503))));
    }
}
