use crate::{Pubkey, Result, UnsignedEvent};

/// Which NIP the ciphertext speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionScheme {
    Nip04,
    Nip44,
}

/// The identity boundary. Implementations hold key material (local keys, a
/// remote bunker, hardware); the core only ever sees signatures and
/// ciphertext. Implementations may block: the publish engine calls `sign`
/// exactly once per publish attempt.
pub trait Signer: Send + Sync {
    fn pubkey(&self) -> Result<Pubkey>;

    /// Produces the hex schnorr signature over `event.id`.
    fn sign(&self, event: &UnsignedEvent) -> Result<String>;

    fn encrypt(&self, peer: &Pubkey, plaintext: &str, scheme: EncryptionScheme) -> Result<String>;

    fn decrypt(&self, peer: &Pubkey, ciphertext: &str, scheme: EncryptionScheme) -> Result<String>;
}
