//! Fan-out publishing and fan-in subscriptions over independent relays.
//!
//! No relay is authoritative. Every call to an endpoint is bounded by the
//! same per-endpoint timeout, so a stalled endpoint only ever fails for
//! itself. A subscription multiplexes one filter across every endpoint and
//! hands each valid event to the caller once.

use crate::*;
use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::stream::{self, Stream};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Where an endpoint pushes events for one subscription.
pub type EventSink = mpsc::UnboundedSender<EventData>;

/// One network endpoint.
///
/// Calls made before the endpoint is connected must not panic: they either
/// wait for the connection or fail for this endpoint only.
#[async_trait]
pub trait Relay: Send + Sync {
    fn url(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    /// `Ok` once the endpoint acknowledged acceptance.
    async fn publish(&self, event: &EventData) -> Result<()>;

    async fn subscribe(&self, sub_id: &str, filter: &Filter, sink: EventSink) -> Result<()>;

    async fn unsubscribe(&self, sub_id: &str) -> Result<()>;

    async fn disconnect(&self);
}

/// Per-endpoint result of a publish.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PublishOutcome {
    pub accepted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl PublishOutcome {
    pub fn is_accepted(&self) -> bool {
        !self.accepted.is_empty()
    }

    /// `PublishFailed` when no endpoint accepted.
    pub fn error(&self) -> Option<ZapError> {
        if self.accepted.is_empty() {
            Some(ZapError::PublishFailed(self.failed.clone()))
        } else {
            None
        }
    }
}

fn timed_out(timeout: Duration) -> ZapError {
    ZapError::Network(format!("no answer within {}ms", timeout.as_millis()))
}

pub struct RelaySet {
    relays: Vec<Arc<dyn Relay>>,
    timeout: Duration,
    next_subscription: AtomicU64,
}

impl RelaySet {
    /// `timeout` bounds each endpoint's connect, publish and subscribe.
    pub fn new(relays: Vec<Arc<dyn Relay>>, timeout: Duration) -> Self {
        Self {
            relays,
            timeout,
            next_subscription: AtomicU64::new(0),
        }
    }

    async fn bounded<T>(&self, call: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or_else(|_| Err(timed_out(self.timeout)))
    }

    pub fn urls(&self) -> Vec<String> {
        self.relays.iter().map(|r| r.url().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Connects every endpoint concurrently. Failures are logged only.
    pub async fn connect(&self) {
        let attempts = self.relays.iter().map(|relay| async move {
            (relay.url().to_string(), self.bounded(relay.connect()).await)
        });
        for (url, result) in join_all(attempts).await {
            match result {
                Ok(()) => info!("connected to {url}"),
                Err(e) => warn!("could not connect to {url}: {e}"),
            }
        }
    }

    /// Publishes to all endpoints at once and reports who accepted.
    pub async fn publish(&self, event: &EventData) -> PublishOutcome {
        let attempts = self.relays.iter().map(|relay| async move {
            (relay.url().to_string(), self.bounded(relay.publish(event)).await)
        });

        let mut outcome = PublishOutcome::default();
        for (url, result) in join_all(attempts).await {
            match result {
                Ok(()) => {
                    debug!("{url} accepted {}", event.id);
                    outcome.accepted.push(url);
                }
                Err(e) => {
                    warn!("{url} did not accept {}: {e}", event.id);
                    outcome.failed.push((url, e.to_string()));
                }
            }
        }
        outcome
    }

    /// Opens one logical subscription across every endpoint.
    pub async fn subscribe(&self, filter: Filter) -> Subscription {
        let sub_id = format!(
            "zap-{}",
            self.next_subscription.fetch_add(1, Ordering::SeqCst)
        );
        let (sink, events) = mpsc::unbounded_channel();

        let requests = self.relays.iter().map(|relay| {
            let sink = sink.clone();
            let sub_id = &sub_id;
            let filter = &filter;
            async move {
                let result = self.bounded(relay.subscribe(sub_id, filter, sink)).await;
                (relay.url(), result)
            }
        });
        for (url, result) in join_all(requests).await {
            if let Err(e) = result {
                warn!("subscription {sub_id} not open on {url}: {e}");
            }
        }
        drop(sink);

        let (closed_tx, closed_rx) = watch::channel(false);
        debug!("opened subscription {sub_id}");
        Subscription {
            events,
            filter,
            seen: HashSet::new(),
            closed_rx,
            handle: SubscriptionHandle {
                inner: Arc::new(HandleInner {
                    sub_id,
                    relays: self.relays.clone(),
                    closed: AtomicBool::new(false),
                    closed_tx,
                }),
            },
        }
    }

    /// First valid event with `id`, or `None` once `timeout` elapses.
    pub async fn fetch_event(&self, id: &str, timeout: Duration) -> Option<EventData> {
        let mut subscription = self.subscribe(Filter::new().id(id).limit(1)).await;
        let found = tokio::time::timeout(timeout, subscription.next())
            .await
            .ok()
            .flatten();
        subscription.close().await;
        found
    }

    pub async fn disconnect(&self) {
        join_all(self.relays.iter().map(|relay| relay.disconnect())).await;
    }
}

struct HandleInner {
    sub_id: String,
    relays: Vec<Arc<dyn Relay>>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

/// Closes a subscription from any task. Closing twice is a no-op.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.inner.sub_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.closed_tx.send_replace(true);

        let sub_id = &self.inner.sub_id;
        let results = join_all(
            self.inner
                .relays
                .iter()
                .map(|relay| async move { (relay.url(), relay.unsubscribe(sub_id).await) }),
        )
        .await;
        for (url, result) in results {
            if let Err(e) = result {
                debug!("closing {sub_id} on {url}: {e}");
            }
        }
        debug!("closed subscription {sub_id}");
    }
}

/// A live subscription yielding verified, deduplicated events.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<EventData>,
    filter: Filter,
    seen: HashSet<String>,
    closed_rx: watch::Receiver<bool>,
    handle: SubscriptionHandle,
}

impl Subscription {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub async fn close(&self) {
        self.handle.close().await;
    }

    /// Next event not seen before, or `None` once closed.
    pub async fn next(&mut self) -> Option<EventData> {
        loop {
            if *self.closed_rx.borrow() {
                return None;
            }
            tokio::select! {
                event = self.events.recv() => {
                    let event = event?;
                    if let Some(event) = self.admit(event) {
                        return Some(event);
                    }
                }
                changed = self.closed_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    // Only valid events mark an id as seen, so a forged copy cannot shadow the real one.
    fn admit(&mut self, event: EventData) -> Option<EventData> {
        if self.seen.contains(&event.id) {
            debug!("duplicate {} on {}", event.id, self.handle.id());
            return None;
        }
        if !self.filter.matches(&event) {
            debug!("{} outside filter of {}", event.id, self.handle.id());
            return None;
        }
        if let Err(e) = check_event(&event) {
            warn!("dropping event on {}: {e}", self.handle.id());
            return None;
        }
        self.seen.insert(event.id.clone());
        Some(event)
    }

    pub fn into_stream(self) -> impl Stream<Item = EventData> {
        stream::unfold(self, |mut subscription| async move {
            let event = subscription.next().await?;
            Some((event, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.handle.is_closed() {
            return;
        }
        let handle = self.handle.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { handle.close().await });
        }
    }
}
