//! Zap request construction and receipt correlation.
//!
//! A correlation attempt moves through
//! `Idle -> RequestBuilt -> Publishing -> AwaitingReceipt -> Matched | Abandoned`.
//! The receipt subscription is keyed on the request id computed locally, so a
//! receipt may arrive before any relay acknowledged the request.

use crate::keys::key_store::KeyStore;
use crate::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ZapState {
    Idle,
    RequestBuilt,
    Publishing,
    AwaitingReceipt,
    Matched { receipt: EventData },
    Abandoned,
}

impl ZapState {
    pub fn is_final(&self) -> bool {
        matches!(self, ZapState::Matched { .. } | ZapState::Abandoned)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZapOutcome {
    Matched(EventData),
    Abandoned,
}

impl From<ZapOutcome> for ZapState {
    fn from(outcome: ZapOutcome) -> Self {
        match outcome {
            ZapOutcome::Matched(receipt) => ZapState::Matched { receipt },
            ZapOutcome::Abandoned => ZapState::Abandoned,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CorrelatorConfig {
    /// Oldest receipt timestamp worth considering.
    pub since: Option<u64>,
    /// Give up waiting for a receipt after this long.
    pub receipt_deadline: Option<Duration>,
}

/// What a point-of-sale order asks to be paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZapOrder {
    pub amount_msat: u64,
    pub recipient_pubkey: String,
    pub destination: String,
    #[serde(default)]
    pub back_reference: Option<String>,
}

/// True when `event` is a receipt by `recipient_pubkey` for `request_id`.
pub fn is_receipt_for(event: &EventData, request_id: &str, recipient_pubkey: &str) -> bool {
    event.kind == KIND_ZAP_RECEIPT
        && event.pubkey == recipient_pubkey
        && event.references(request_id)
}

pub struct ZapCorrelator {
    relays: Arc<RelaySet>,
    keys: Arc<KeyStore>,
    config: CorrelatorConfig,
}

impl ZapCorrelator {
    pub fn new(relays: Arc<RelaySet>, keys: Arc<KeyStore>, config: CorrelatorConfig) -> Self {
        Self {
            relays,
            keys,
            config,
        }
    }

    pub fn relays(&self) -> &Arc<RelaySet> {
        &self.relays
    }

    /// Builds and signs a zap request. Only the timestamp is taken from the clock.
    pub fn generate_request(
        &self,
        amount_msat: u64,
        recipient_pubkey: &str,
        destination: &str,
        back_reference: Option<&str>,
    ) -> Result<EventData> {
        let identity = self.keys.identity()?;
        if !is_hex_of_len(recipient_pubkey, 64) {
            return Err(ZapError::MalformedEvent(format!(
                "recipient pubkey is not 32-byte hex: {recipient_pubkey}"
            )));
        }
        if destination.is_empty() {
            return Err(ZapError::MalformedEvent("empty destination".to_string()));
        }

        let mut relays_tag = vec!["relays".to_string()];
        relays_tag.extend(self.relays.urls());
        let mut tags = vec![
            relays_tag,
            vec!["amount".to_string(), amount_msat.to_string()],
            vec!["lnurl".to_string(), destination.to_string()],
            vec!["p".to_string(), recipient_pubkey.to_string()],
        ];
        if let Some(event_id) = back_reference {
            if !is_hex_of_len(event_id, 64) {
                return Err(ZapError::MalformedEvent(format!(
                    "back reference is not an event id: {event_id}"
                )));
            }
            tags.push(vec!["e".to_string(), event_id.to_string()]);
        }

        let request = create_event_sig(
            identity.key_pair(),
            KIND_ZAP_REQUEST,
            tags,
            String::new(),
            unix_now(),
        )?;
        debug!("zap request {} for {amount_msat} msat", request.id);
        Ok(request)
    }

    /// Best-effort publish; zero acceptances is logged, not returned as an error.
    pub async fn publish(&self, request: &EventData) -> PublishOutcome {
        let outcome = self.relays.publish(request).await;
        match outcome.error() {
            Some(e) => warn!("zap request {}: {e}", request.id),
            None => info!(
                "zap request {} accepted by {}/{} relays",
                request.id,
                outcome.accepted.len(),
                self.relays.len()
            ),
        }
        outcome
    }

    pub fn receipt_filter(&self, request_id: &str, recipient_pubkey: &str) -> Filter {
        Filter::new()
            .kind(KIND_ZAP_RECEIPT)
            .author(recipient_pubkey)
            .event_reference(request_id)
            .since(self.config.since)
    }

    pub async fn subscribe_for_receipt(
        &self,
        request_id: &str,
        recipient_pubkey: &str,
    ) -> Subscription {
        info!("listening for zap receipt of {request_id} from {recipient_pubkey}");
        self.relays
            .subscribe(self.receipt_filter(request_id, recipient_pubkey))
            .await
    }

    /// Takes the first valid receipt, then closes the subscription.
    ///
    /// Closing the subscription from elsewhere, or hitting `deadline`, abandons.
    pub async fn await_receipt(
        mut subscription: Subscription,
        request_id: &str,
        recipient_pubkey: &str,
        deadline: Option<Duration>,
    ) -> ZapOutcome {
        let first_receipt = async {
            while let Some(event) = subscription.next().await {
                if is_receipt_for(&event, request_id, recipient_pubkey) {
                    return Some(event);
                }
                debug!("{} is not a receipt for {request_id}", event.id);
            }
            None
        };
        let receipt = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, first_receipt)
                .await
                .unwrap_or_else(|_| {
                    info!("no receipt for {request_id} within {}s", deadline.as_secs());
                    None
                }),
            None => first_receipt.await,
        };
        subscription.close().await;

        match receipt {
            Some(receipt) => {
                info!("zap {request_id} paid, receipt {}", receipt.id);
                ZapOutcome::Matched(receipt)
            }
            None => {
                info!("zap {request_id} abandoned");
                ZapOutcome::Abandoned
            }
        }
    }

    /// Builds the request, then subscribes and publishes concurrently.
    pub async fn start(&self, order: &ZapOrder) -> Result<PendingZap> {
        let (state_tx, _) = watch::channel(ZapState::Idle);
        self.start_observed(order, state_tx).await
    }

    /// Like [`ZapCorrelator::start`], reporting every transition on `state_tx`,
    /// including the ones before `start` returns.
    pub async fn start_observed(
        &self,
        order: &ZapOrder,
        state_tx: watch::Sender<ZapState>,
    ) -> Result<PendingZap> {
        let request = self.generate_request(
            order.amount_msat,
            &order.recipient_pubkey,
            &order.destination,
            order.back_reference.as_deref(),
        )?;
        state_tx.send_replace(ZapState::RequestBuilt);
        let state_rx = state_tx.subscribe();

        state_tx.send_replace(ZapState::Publishing);
        let (subscription, publish) = tokio::join!(
            self.subscribe_for_receipt(&request.id, &order.recipient_pubkey),
            self.publish(&request)
        );
        state_tx.send_replace(ZapState::AwaitingReceipt);

        let handle = subscription.handle();
        let request_id = request.id.clone();
        let recipient_pubkey = order.recipient_pubkey.clone();
        let deadline = self.config.receipt_deadline;
        tokio::spawn(async move {
            let outcome =
                Self::await_receipt(subscription, &request_id, &recipient_pubkey, deadline).await;
            state_tx.send_replace(outcome.into());
        });

        Ok(PendingZap {
            request,
            publish,
            state: state_rx,
            handle,
        })
    }
}

/// One in-flight correlation attempt.
pub struct PendingZap {
    request: EventData,
    publish: PublishOutcome,
    state: watch::Receiver<ZapState>,
    handle: SubscriptionHandle,
}

impl PendingZap {
    pub fn request(&self) -> &EventData {
        &self.request
    }

    pub fn request_id(&self) -> &str {
        &self.request.id
    }

    pub fn publish_outcome(&self) -> &PublishOutcome {
        &self.publish
    }

    pub fn state(&self) -> ZapState {
        self.state.borrow().clone()
    }

    /// Resolves once the attempt is matched or abandoned.
    pub async fn outcome(&mut self) -> ZapState {
        loop {
            let state = self.state.borrow_and_update().clone();
            if state.is_final() {
                return state;
            }
            if self.state.changed().await.is_err() {
                return self.state();
            }
        }
    }

    /// Abandons the attempt. A no-op once it is matched or already cancelled.
    pub async fn cancel(&self) {
        self.handle.close().await;
    }
}

impl Drop for PendingZap {
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
