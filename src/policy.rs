//! Event validation: signature verification and the publisher policy.

use std::collections::HashMap;

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};

use crate::error::RelayError;
use crate::event::{Event, KIND_APP, KIND_RELEASE};

/// Accept/reject gate applied to every submitted event.
pub struct Policy {
    verify_sig: bool,
    /// Publisher pubkey to `d`-tag rules; an empty vec means unrestricted.
    /// An empty map admits every publisher.
    allow: HashMap<String, Vec<String>>,
}

impl Policy {
    pub fn new(verify_sig: bool, allow: HashMap<String, Vec<String>>) -> Self {
        Self { verify_sig, allow }
    }

    /// Validate a decoded event. Failures are soft: the caller answers the
    /// client with OK-false and never persists the event.
    pub fn validate(&self, ev: &Event) -> Result<(), RelayError> {
        if self.verify_sig {
            verify_event(ev)?;
        }
        self.check_publisher(ev)
    }

    fn check_publisher(&self, ev: &Event) -> Result<(), RelayError> {
        if self.allow.is_empty() {
            return Ok(());
        }
        let Some(rules) = self.allow.get(&ev.pubkey) else {
            return Err(RelayError::NotAuthorized("publisher not allowed".into()));
        };
        if rules.is_empty() {
            return Ok(());
        }
        match ev.kind {
            KIND_RELEASE => {
                if rules.iter().any(|p| ev.d_tag().starts_with(p.as_str())) {
                    Ok(())
                } else {
                    Err(RelayError::NotAuthorized(
                        "d tag outside allowed prefixes".into(),
                    ))
                }
            }
            KIND_APP => {
                if rules.iter().any(|v| ev.d_tag() == v) {
                    Ok(())
                } else {
                    Err(RelayError::NotAuthorized(
                        "d tag not in allowed values".into(),
                    ))
                }
            }
            _ => Ok(()),
        }
    }
}

/// Verify an event's id digest and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<(), RelayError> {
    let hash = ev.digest()?;
    if hex::encode(hash) != ev.id {
        return Err(RelayError::SignatureInvalid);
    }
    let sig = hex::decode(&ev.sig)
        .ok()
        .and_then(|raw| Signature::from_slice(&raw).ok())
        .ok_or(RelayError::SignatureInvalid)?;
    let pk = hex::decode(&ev.pubkey)
        .ok()
        .and_then(|raw| XOnlyPublicKey::from_slice(&raw).ok())
        .ok_or(RelayError::SignatureInvalid)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash).map_err(|_| RelayError::SignatureInvalid)?;
    secp.verify_schnorr(&sig, &msg, &pk)
        .map_err(|_| RelayError::SignatureInvalid)
}
