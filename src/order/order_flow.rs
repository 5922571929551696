//! Point-of-sale order flow: scan, resolve, amount, transfer, await receipt.
//!
//! Holds at most one in-flight zap. Starting a new transfer or clearing the
//! order abandons the previous one.

use crate::order::lnurl::{extract_lnurl_from_qr, Destination, LnurlResolver};
use crate::zap::zap_correlator::{PendingZap, ZapCorrelator, ZapOrder, ZapState};
use crate::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct OrderFlow {
    correlator: Arc<ZapCorrelator>,
    destination: Option<Destination>,
    amount_msat: u64,
    pending: Option<PendingZap>,
}

impl OrderFlow {
    pub fn new(correlator: Arc<ZapCorrelator>) -> Self {
        Self {
            correlator,
            destination: None,
            amount_msat: 0,
            pending: None,
        }
    }

    /// Resets the order, abandoning any zap still awaiting its receipt.
    pub async fn clear(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel().await;
        }
        self.destination = None;
        self.amount_msat = 0;
    }

    pub async fn scan<R: LnurlResolver + ?Sized>(
        &mut self,
        raw: &str,
        resolver: &R,
    ) -> Result<&Destination> {
        let lnurl = extract_lnurl_from_qr(raw).ok_or(ZapError::InvalidQr)?;
        let destination = resolver.resolve(&lnurl).await?;
        if !is_hex_of_len(&destination.recipient_pubkey, 64) {
            return Err(ZapError::InvalidLnurl(format!(
                "{lnurl} does not advertise a zap recipient"
            )));
        }
        info!("scanned {}", destination.destination);
        Ok(&*self.destination.insert(destination))
    }

    pub fn set_destination(&mut self, destination: Destination) {
        self.destination = Some(destination);
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    pub fn set_amount(&mut self, amount_msat: u64) {
        self.amount_msat = amount_msat;
    }

    pub fn set_amount_sats(&mut self, sats: u64) {
        self.amount_msat = sats.saturating_mul(1000);
    }

    pub fn amount_msat(&self) -> u64 {
        self.amount_msat
    }

    /// Builds, publishes, and starts awaiting the receipt for the current order.
    pub async fn transfer(&mut self, back_reference: Option<String>) -> Result<&PendingZap> {
        let destination = self
            .destination
            .clone()
            .ok_or(ZapError::OrderIncomplete("no destination scanned"))?;
        if self.amount_msat == 0 {
            return Err(ZapError::OrderIncomplete("amount is zero"));
        }
        if let Some(previous) = self.pending.take() {
            previous.cancel().await;
        }

        let order = ZapOrder {
            amount_msat: self.amount_msat,
            recipient_pubkey: destination.recipient_pubkey,
            destination: destination.destination,
            back_reference,
        };
        let pending = self.correlator.start(&order).await?;
        info!("order {} in flight", pending.request_id());
        Ok(&*self.pending.insert(pending))
    }

    pub fn pending(&self) -> Option<&PendingZap> {
        self.pending.as_ref()
    }

    pub fn state(&self) -> ZapState {
        self.pending
            .as_ref()
            .map(PendingZap::state)
            .unwrap_or(ZapState::Idle)
    }

    /// Waits for the in-flight zap to settle, abandoning it after `deadline`.
    pub async fn wait(&mut self, deadline: Option<Duration>) -> ZapState {
        let Some(pending) = self.pending.as_mut() else {
            return ZapState::Idle;
        };
        match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, pending.outcome()).await {
                Ok(state) => state,
                Err(_) => {
                    pending.cancel().await;
                    pending.outcome().await
                }
            },
            None => pending.outcome().await,
        }
    }
}
