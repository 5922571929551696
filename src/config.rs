use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Always listened to in addition to the configured relay.
pub const FALLBACK_RELAY: &str = "wss://relay.hodl.ar";

/// Point-of-sale zap service.
#[derive(Debug, Clone, Parser)]
#[command(name = "rs_zap_pos", version, about)]
pub struct Config {
    /// Primary relay URL.
    #[arg(long, env = "NOSTR_RELAY")]
    pub relay: String,

    /// File holding the local signing key.
    #[arg(long, env = "ZAP_KEY_FILE", default_value = "zap_pos_keys.json")]
    pub key_file: PathBuf,

    /// Address the HTTP API listens on.
    #[arg(long, env = "ZAP_BIND", default_value = "127.0.0.1:8080")]
    pub bind: String,

    /// Ignore receipts created before this unix timestamp.
    #[arg(long, env = "ZAP_SINCE")]
    pub since: Option<u64>,

    /// How long to wait for each relay to connect, subscribe or acknowledge a publish.
    #[arg(long, env = "ZAP_RELAY_TIMEOUT_MS", default_value_t = 5000)]
    pub relay_timeout_ms: u64,

    /// Abandon an order when no receipt arrives within this many seconds.
    #[arg(long, env = "ZAP_RECEIPT_DEADLINE_SECS")]
    pub receipt_deadline_secs: Option<u64>,
}

impl Config {
    /// Primary relay followed by the fallback, without duplicates.
    pub fn relay_urls(&self) -> Vec<String> {
        let mut urls = vec![self.relay.clone()];
        if self.relay.trim_end_matches('/') != FALLBACK_RELAY {
            urls.push(FALLBACK_RELAY.to_string());
        }
        urls
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }

    pub fn receipt_deadline(&self) -> Option<Duration> {
        self.receipt_deadline_secs.map(Duration::from_secs)
    }
}
