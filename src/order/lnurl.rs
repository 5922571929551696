use crate::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Where a scanned card or QR code sends funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub recipient_pubkey: String,
    pub destination: String,
}

/// Resolves an LNURL into payment metadata. HTTP resolution lives outside this crate.
#[async_trait]
pub trait LnurlResolver: Send + Sync {
    /// Fails with `InvalidLnurl` or `Network`.
    async fn resolve(&self, lnurl: &str) -> Result<Destination>;
}

const LNURL_HRP: &str = "lnurl";

// Checksum and prefix must both hold; the payload is the encoded callback URL.
fn is_bech32_lnurl(candidate: &str) -> bool {
    match bech32::decode(candidate) {
        Ok((hrp, data)) => hrp.as_str() == LNURL_HRP && !data.is_empty(),
        Err(_) => false,
    }
}

fn is_lightning_address(candidate: &str) -> bool {
    match candidate.split_once('@') {
        Some((name, domain)) => {
            !name.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !candidate.contains(char::is_whitespace)
                && !domain.contains('@')
        }
        None => false,
    }
}

/// Pulls an LNURL out of scanned text, or `None` for an unrecognized payload.
///
/// Accepts bech32 `lnurl1...` strings (bare, behind `lightning:`, or in a
/// `lightning=` query parameter), `lnurlp://`/`lnurlw://` URLs and lightning
/// addresses.
pub fn extract_lnurl_from_qr(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();

    if lower.starts_with("lnurlp://") || lower.starts_with("lnurlw://") {
        return Some(trimmed.to_string());
    }

    let candidate = if let Some(rest) = lower.strip_prefix("lightning:") {
        rest.to_string()
    } else if let Some(index) = lower.find("lightning=") {
        lower[index + "lightning=".len()..]
            .split('&')
            .next()
            .unwrap_or_default()
            .to_string()
    } else {
        lower
    };

    if is_bech32_lnurl(&candidate) || is_lightning_address(&candidate) {
        Some(candidate)
    } else {
        None
    }
}
