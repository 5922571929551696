//! Shared fixtures for the zap integration tests.

use rs_zap_pos::keys::key_store::{KeyStore, MemoryStore};
use rs_zap_pos::relay::memory_relay::MemoryRelay;
use rs_zap_pos::zap::zap_correlator::{CorrelatorConfig, ZapOrder};
use rs_zap_pos::{
    create_event_sig, public_key_hex, unix_now, EventData, Relay, RelaySet, ZapCorrelator,
    KIND_ZAP_RECEIPT,
};
use secp256k1::rand::rngs::OsRng;
use secp256k1::{KeyPair, Secp256k1};
use std::sync::Arc;
use std::time::Duration;

/// Two in-memory relays, a loaded key store and a zap recipient.
#[allow(dead_code)]
pub struct TestContext {
    pub relays: Vec<Arc<MemoryRelay>>,
    pub relay_set: Arc<RelaySet>,
    pub keys: Arc<KeyStore>,
    pub correlator: Arc<ZapCorrelator>,
    pub recipient: KeyPair,
}

#[allow(dead_code)]
impl TestContext {
    pub fn new() -> Self {
        Self::with_config(CorrelatorConfig::default())
    }

    pub fn with_config(config: CorrelatorConfig) -> Self {
        let relays = vec![
            Arc::new(MemoryRelay::new("wss://relay.one")),
            Arc::new(MemoryRelay::new("wss://relay.two")),
        ];
        let relay_set = Arc::new(RelaySet::new(
            relays.iter().map(|r| r.clone() as Arc<dyn Relay>).collect(),
            Duration::from_millis(200),
        ));
        let keys = Arc::new(KeyStore::new(Box::new(MemoryStore::new())));
        keys.get_or_create_private_key().unwrap();
        let correlator = Arc::new(ZapCorrelator::new(relay_set.clone(), keys.clone(), config));

        Self {
            relays,
            relay_set,
            keys,
            correlator,
            recipient: KeyPair::new(&Secp256k1::new(), &mut OsRng),
        }
    }

    pub fn recipient_pubkey(&self) -> String {
        public_key_hex(&self.recipient)
    }

    pub fn order(&self, amount_msat: u64) -> ZapOrder {
        ZapOrder {
            amount_msat,
            recipient_pubkey: self.recipient_pubkey(),
            destination: "user@domain.com".to_string(),
            back_reference: None,
        }
    }

    /// A receipt for `request_id` signed by the recipient.
    pub fn receipt_for(&self, request_id: &str) -> EventData {
        receipt(&self.recipient, request_id)
    }
}

/// A receipt for `request_id` signed by `author`.
#[allow(dead_code)]
pub fn receipt(author: &KeyPair, request_id: &str) -> EventData {
    create_event_sig(
        author,
        KIND_ZAP_RECEIPT,
        vec![
            vec!["bolt11".to_string(), "lnbc10n1pj".to_string()],
            vec!["e".to_string(), request_id.to_string()],
        ],
        String::new(),
        unix_now(),
    )
    .unwrap()
}
