//! In-process relay for tests and offline demos.
//!
//! Stores what is published, replays stored events to new subscriptions,
//! and pushes newly published events to matching subscriptions, the way a
//! network relay does.

use crate::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub struct MemoryRelay {
    url: String,
    online: AtomicBool,
    accept: AtomicBool,
    stalled: AtomicBool,
    delay: Mutex<Option<Duration>>,
    events: Mutex<Vec<EventData>>,
    subscriptions: Mutex<HashMap<String, (Filter, EventSink)>>,
}

impl MemoryRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            online: AtomicBool::new(true),
            accept: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
            delay: Mutex::new(None),
            events: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// An offline relay refuses every call with a network error.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// A relay that does not accept answers `OK false`.
    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    /// A stalled relay never answers connect, publish or subscribe.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Delay before acknowledging a publish.
    pub fn set_delay(&self, delay: Duration) {
        if let Ok(mut current) = self.delay.lock() {
            *current = Some(delay);
        }
    }

    pub fn published(&self) -> Vec<EventData> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Pushes `event` to every subscription whose filter matches.
    pub fn deliver(&self, event: &EventData) {
        self.push(event, true);
    }

    /// Pushes `event` to every subscription, ignoring filters.
    pub fn deliver_raw(&self, event: &EventData) {
        self.push(event, false);
    }

    fn push(&self, event: &EventData, filtered: bool) {
        if let Ok(subscriptions) = self.subscriptions.lock() {
            for (filter, sink) in subscriptions.values() {
                if !filtered || filter.matches(event) {
                    let _ = sink.send(event.clone());
                }
            }
        }
    }

    async fn ensure_online(&self) -> Result<()> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ZapError::Network(format!("{} is unreachable", self.url)))
        }
    }

    fn poisoned() -> ZapError {
        ZapError::Network("memory relay poisoned".to_string())
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<()> {
        self.ensure_online().await
    }

    async fn publish(&self, event: &EventData) -> Result<()> {
        self.ensure_online().await?;
        let delay = *self.delay.lock().map_err(|_| Self::poisoned())?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.accept.load(Ordering::SeqCst) {
            return Err(ZapError::Rejected("blocked: not accepting events".to_string()));
        }
        self.events
            .lock()
            .map_err(|_| Self::poisoned())?
            .push(event.clone());
        self.deliver(event);
        Ok(())
    }

    async fn subscribe(&self, sub_id: &str, filter: &Filter, sink: EventSink) -> Result<()> {
        self.ensure_online().await?;
        let stored = self.published();
        for event in stored.iter().filter(|e| filter.matches(e)) {
            let _ = sink.send(event.clone());
        }
        self.subscriptions
            .lock()
            .map_err(|_| Self::poisoned())?
            .insert(sub_id.to_string(), (filter.clone(), sink));
        Ok(())
    }

    async fn unsubscribe(&self, sub_id: &str) -> Result<()> {
        self.subscriptions
            .lock()
            .map_err(|_| Self::poisoned())?
            .remove(sub_id);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.clear();
        }
    }
}
