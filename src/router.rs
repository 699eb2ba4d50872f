//! Request router (spec.md §4.F): outbound `iq` correlation by message tag,
//! and a pattern-subscription registry for async inbound stanzas.

use crate::binary::Node;
use crate::error::{ConnectionError, Error, SendError};
use crate::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

/// A single attribute selector used to match a subscription against an
/// inbound node, e.g. `("class", "message")` for `ack:class=message`.
pub type AttrSelector = (String, String);

/// Match key for a subscription: a tag plus zero or more attr selectors.
/// Longest/most-specific match wins (spec.md §4.F).
#[derive(Clone, Debug)]
pub struct StanzaPattern {
    pub tag: String,
    pub selectors: Vec<AttrSelector>,
}

impl StanzaPattern {
    pub fn tag(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            selectors: Vec::new(),
        }
    }

    pub fn with_selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.selectors.push((key.into(), value.into()));
        self
    }

    fn matches(&self, node: &Node) -> bool {
        if self.tag != node.tag {
            return false;
        }
        self.selectors
            .iter()
            .all(|(k, v)| node.attrs.get(k).map(|got| got == v).unwrap_or(false))
    }

    fn specificity(&self) -> usize {
        self.selectors.len()
    }
}

type Subscriber = Box<dyn Fn(&Node) + Send + Sync>;

/// Correlates outbound `iq` tags to their eventual response, and fans out
/// unsolicited inbound stanzas to pattern subscribers.
pub struct Router {
    waiters: Mutex<HashMap<String, oneshot::Sender<Node>>>,
    subscriptions: Mutex<Vec<(StanzaPattern, Subscriber)>>,
    tag_counter: AtomicU64,
    default_timeout: Duration,
}

impl Router {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            tag_counter: AtomicU64::new(1),
            default_timeout,
        }
    }

    /// Generates a unique message tag for an outbound request.
    pub fn generate_tag(&self) -> String {
        let n = self.tag_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}.{}", std::process::id(), n)
    }

    /// Registers a waiter for `tag` and returns a future that resolves when
    /// a matching inbound `iq` arrives, or errors with `timeout` after
    /// `default_query_timeout_ms` (spec.md §4.F, §5).
    pub async fn wait_for(&self, tag: &str) -> oneshot::Receiver<Node> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(tag.to_string(), tx);
        rx
    }

    pub async fn wait_for_with_timeout(&self, tag: &str) -> Result<Node> {
        let rx = self.wait_for(tag).await;
        match tokio::time::timeout(self.default_timeout, rx).await {
            Ok(Ok(node)) => Self::reject_rate_limited(node),
            Ok(Err(_)) => Err(Error::Connection(ConnectionError::Disconnected)),
            Err(_) => Err(Error::Connection(ConnectionError::Timeout)),
        }
    }

    /// An `iq type="error"` carrying `<error code="429">` means the server
    /// is throttling this connection (spec.md §7 "rate": 429 -> surface to
    /// caller as rate-limit error).
    fn reject_rate_limited(node: Node) -> Result<Node> {
        if node.attrs.get("type").map(String::as_str) == Some("error") {
            if let Some(code) = node.get_child_by_tag("error").and_then(|e| e.attrs.get("code")) {
                if code == "429" {
                    return Err(Error::Send(SendError::RateLimited));
                }
            }
        }
        Ok(node)
    }

    /// Registers an async pattern subscriber (e.g. for `message`, `receipt`,
    /// `call`, `ack:class=message`).
    pub async fn subscribe<F>(&self, pattern: StanzaPattern, f: F)
    where
        F: Fn(&Node) + Send + Sync + 'static,
    {
        self.subscriptions.lock().await.push((pattern, Box::new(f)));
    }

    /// Cancels every pending `iq` waiter with a "connection closed" error
    /// (spec.md §5 `close()` semantics).
    pub async fn cancel_all(&self) {
        let mut waiters = self.waiters.lock().await;
        for (_, tx) in waiters.drain() {
            let _ = tx.send(Node::new("__connection_closed__"));
        }
    }

    /// Dispatches one inbound node: completes a waiting `iq` caller if the
    /// `id` attr matches a pending tag, otherwise routes to the
    /// longest-matching pattern subscription. Unmatched stanzas are logged
    /// at debug (the caller is still responsible for acking them).
    pub async fn dispatch(&self, node: Node) {
        if node.tag == "iq" {
            if let Some(id) = node.attrs.get("id").cloned() {
                let mut waiters = self.waiters.lock().await;
                if let Some(tx) = waiters.remove(&id) {
                    let _ = tx.send(node);
                    return;
                }
            }
        }

        let subs = self.subscriptions.lock().await;
        let best = subs
            .iter()
            .filter(|(pattern, _)| pattern.matches(&node))
            .max_by_key(|(pattern, _)| pattern.specificity());

        match best {
            Some((_, handler)) => handler(&node),
            None => tracing::debug!(tag = %node.tag, "unmatched stanza"),
        }
    }
}

pub type SharedRouter = Arc<Router>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn iq_waiter_resolves_on_matching_id() {
        let router = Router::new(Duration::from_secs(1));
        let tag = router.generate_tag();
        let rx = router.wait_for(&tag).await;
        let response = Node::new("iq").with_attr("id", tag.clone());
        router.dispatch(response).await;
        let got = rx.await.unwrap();
        assert_eq!(got.attrs.get("id"), Some(&tag));
    }

    #[tokio::test]
    async fn iq_waiter_times_out() {
        let router = Router::new(Duration::from_millis(20));
        let tag = router.generate_tag();
        let result = router.wait_for_with_timeout(&tag).await;
        assert!(matches!(
            result,
            Err(Error::Connection(ConnectionError::Timeout))
        ));
    }

    #[tokio::test]
    async fn longest_match_wins() {
        let router = Router::new(Duration::from_secs(1));
        let generic_hit = Arc::new(AtomicBool::new(false));
        let specific_hit = Arc::new(AtomicBool::new(false));

        let g = Arc::clone(&generic_hit);
        router
            .subscribe(StanzaPattern::tag("ack"), move |_| {
                g.store(true, Ordering::SeqCst);
            })
            .await;
        let s = Arc::clone(&specific_hit);
        router
            .subscribe(StanzaPattern::tag("ack").with_selector("class", "message"), move |_| {
                s.store(true, Ordering::SeqCst);
            })
            .await;

        router
            .dispatch(Node::new("ack").with_attr("class", "message"))
            .await;

        assert!(specific_hit.load(Ordering::SeqCst));
        assert!(!generic_hit.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn rate_limited_iq_response_surfaces_as_rate_error() {
        let router = Router::new(Duration::from_secs(1));
        let tag = router.generate_tag();
        let rx = router.wait_for(&tag).await;
        let error_response = Node::new("iq")
            .with_attr("id", tag.clone())
            .with_attr("type", "error")
            .with_children(vec![Node::new("error").with_attr("code", "429")]);
        router.dispatch(error_response).await;
        let node = rx.await.unwrap();
        let result = Router::reject_rate_limited(node);
        assert!(matches!(result, Err(Error::Send(SendError::RateLimited))));
    }

    #[tokio::test]
    async fn cancel_all_resolves_pending_waiters() {
        let router = Router::new(Duration::from_secs(5));
        let tag = router.generate_tag();
        let rx = router.wait_for(&tag).await;
        router.cancel_all().await;
        assert!(rx.await.is_ok());
    }
}
