use crate::*;
use hex::decode;
use secp256k1::schnorr::Signature;
use secp256k1::{KeyPair, Message, Secp256k1, XOnlyPublicKey};
use std::str::FromStr;

/// Hex id of an event: sha256 over `[0, pubkey, created_at, kind, tags, content]`.
///
/// Tag order is part of the hash, so callers finalize tags before calling.
pub fn compute_id(fields: &SignEventData) -> Result<String> {
    fields.validate()?;
    let canonical = serde_json::json!([
        0,
        fields.pubkey,
        fields.created_at,
        fields.kind,
        fields.tags,
        fields.content
    ]);
    let canonical = canonical.to_string();
    Ok(sha256::digest(canonical.as_str()))
}

fn id_message(id: &str) -> Result<Message> {
    let bytes = decode(id).map_err(|e| ZapError::MalformedEvent(format!("id is not hex: {e}")))?;
    Message::from_slice(&bytes).map_err(|e| ZapError::MalformedEvent(format!("id: {e}")))
}

/// Schnorr signature over the id, hex encoded.
pub fn sign_id(id: &str, key_pair: &KeyPair) -> Result<String> {
    let secp = Secp256k1::new();
    let message = id_message(id)?;
    let sig = secp.sign_schnorr(&message, key_pair);
    Ok(sig.to_string())
}

/// X-only public key of `key_pair`, hex encoded.
pub fn public_key_hex(key_pair: &KeyPair) -> String {
    let (x_only, _parity) = key_pair.x_only_public_key();
    x_only.to_string()
}

pub fn create_event_sig(
    key_pair: &KeyPair,
    kind: u32,
    tags: Vec<Vec<String>>,
    content: String,
    created_at: u64,
) -> Result<EventData> {
    let unsigned = SignEventData {
        pubkey: public_key_hex(key_pair),
        created_at,
        kind,
        tags,
        content,
    };
    let id = compute_id(&unsigned)?;
    let sig = sign_id(&id, key_pair)?;
    Ok(EventData {
        id,
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig,
    })
}

/// Checks the id first, then the signature against the recomputed id.
pub fn check_event(event: &EventData) -> Result<()> {
    let id = compute_id(&event.unsigned())?;
    if id != event.id {
        return Err(ZapError::VerificationFailed(format!(
            "id mismatch for {}",
            event.id
        )));
    }

    let x_only_pubkey = XOnlyPublicKey::from_str(&event.pubkey)
        .map_err(|e| ZapError::MalformedEvent(format!("pubkey: {e}")))?;
    let sig_bytes = decode(&event.sig)
        .map_err(|_| ZapError::VerificationFailed("signature is not hex".to_string()))?;
    let sig = Signature::from_slice(&sig_bytes)
        .map_err(|_| ZapError::VerificationFailed("invalid signature encoding".to_string()))?;

    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(&sig, &id_message(&id)?, &x_only_pubkey)
        .map_err(|_| ZapError::VerificationFailed(format!("bad signature on {id}")))
}

pub fn verify_event_sig(event: &EventData) -> bool {
    check_event(event).is_ok()
}
