#![cfg(test)]
//! Shared helpers for unit tests: a no-op wakeup and a deterministic
//! signer that produces structurally valid (not cryptographically valid)
//! signatures.

use crate::event::UnsignedEvent;
use crate::signer::{EncryptionScheme, Signer};
use crate::{Pubkey, Result, Wakeup};

/// A Wakeup that does nothing; unit tests drive the pool by hand.
#[derive(Clone, Default)]
pub struct MockWakeup {}

impl MockWakeup {
    pub fn new() -> Self {
        Self {}
    }
}

impl Wakeup for MockWakeup {
    fn wake(&self) {}
}

/// Signs with a fixed fake signature. Good enough for every path that
/// treats signatures as opaque strings (all of the core).
pub struct StubSigner {
    pubkey: Pubkey,
}

impl StubSigner {
    pub fn new(pubkey_hex: &str) -> Self {
        Self {
            pubkey: Pubkey::from_hex(pubkey_hex).expect("stub pubkey"),
        }
    }
}

impl Signer for StubSigner {
    fn pubkey(&self) -> Result<Pubkey> {
        Ok(self.pubkey)
    }

    fn sign(&self, event: &UnsignedEvent) -> Result<String> {
        // deterministic per event id, visibly fake
        Ok(format!("{}{}", event.id.hex(), event.id.hex()))
    }

    fn encrypt(&self, _peer: &Pubkey, plaintext: &str, _scheme: EncryptionScheme) -> Result<String> {
        Ok(format!("enc:{plaintext}"))
    }

    fn decrypt(&self, _peer: &Pubkey, ciphertext: &str, _scheme: EncryptionScheme) -> Result<String> {
        Ok(ciphertext.strip_prefix("enc:").unwrap_or(ciphertext).to_owned())
    }
}
