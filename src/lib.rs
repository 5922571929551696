//! Zap correlation for a point-of-sale flow.
//!
//! Builds signed zap requests for an order, publishes them to several relays,
//! and watches for the one receipt that proves the order was paid.

pub mod config;
pub mod error;
pub mod event_data;

pub mod helper {
    pub mod helper;
}

pub mod keys {
    pub mod key_store;
}

pub mod order {
    pub mod lnurl;
    pub mod order_flow;
}

pub mod relay {
    pub mod filter;
    pub mod memory_relay;
    pub mod relay_set;
}

pub mod sign {
    pub mod event_signature;
}

pub mod websocket {
    pub mod relay_message;
    pub mod ws_relay;
}

pub mod zap {
    pub mod zap_correlator;
}

pub use error::{Result, ZapError};
pub use event_data::{EventData, SignEventData, KIND_ZAP_RECEIPT, KIND_ZAP_REQUEST};
pub use helper::helper::{is_hex_of_len, json_parse, json_stringify, unix_now};
pub use keys::key_store::{Identity, KeyStore};
pub use relay::filter::Filter;
pub use relay::relay_set::{
    EventSink, PublishOutcome, Relay, RelaySet, Subscription, SubscriptionHandle,
};
pub use sign::event_signature::{
    check_event, compute_id, create_event_sig, public_key_hex, sign_id, verify_event_sig,
};
pub use zap::zap_correlator::{ZapCorrelator, ZapOutcome, ZapState};
