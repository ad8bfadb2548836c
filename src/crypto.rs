//! Stream cipher setup for client traffic.
//!
//! Every session derives one encrypt and one decrypt RC4 stream from the
//! same pre-shared key. Each stream consumes its keystream strictly in
//! order, so a stream must only ever see one direction of one connection.

use rc4::consts::U32;
use rc4::{Key, KeyInit, Rc4, StreamCipher};

/// RC4 instance keyed with a 32-byte key.
type Stream = Rc4<U32>;

/// Error raised when the configured key cannot build a cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherError {
    /// The key does not have the required length.
    InvalidKeyLength(usize),
}

impl std::fmt::Display for CipherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CipherError::InvalidKeyLength(len) => {
                write!(f, "Invalid RC4 key length {} (expected 32 bytes)", len)
            }
        }
    }
}

impl std::error::Error for CipherError {}

/// A validated session key.
///
/// Validation happens once at startup, so building ciphers per session
/// cannot fail afterwards.
#[derive(Clone)]
pub struct SessionKey {
    key: Key<U32>,
}

impl SessionKey {
    /// Validate raw key bytes.
    pub fn new(bytes: &[u8]) -> Result<Self, CipherError> {
        // Build a throwaway stream so a bad key is reported the same way
        // the cipher itself would report it.
        Stream::new_from_slice(bytes).map_err(|_| CipherError::InvalidKeyLength(bytes.len()))?;
        Ok(Self {
            key: Key::<U32>::clone_from_slice(bytes),
        })
    }

    /// Build a fresh encrypt/decrypt pair positioned at keystream start.
    pub fn ciphers(&self) -> CipherPair {
        CipherPair {
            encoder: Stream::new(&self.key),
            decoder: Stream::new(&self.key),
        }
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Encrypt and decrypt streams of one connection.
pub struct CipherPair {
    encoder: Stream,
    decoder: Stream,
}

impl CipherPair {
    /// Encrypt data headed for the client, in place.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.encoder.apply_keystream(data);
    }

    /// Decrypt data received from the client, in place.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.decoder.apply_keystream(data);
    }
}

impl std::fmt::Debug for CipherPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherPair(..)")
    }
}

/// Session status bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags(u8);

impl SessionFlags {
    /// Per-session key exchange finished. Reserved: no handshake exists.
    #[allow(dead_code)]
    pub const KEY_EXCHANGED: u8 = 0x1;
    /// Ciphers are in place and traffic is encrypted.
    pub const ENCRYPT: u8 = 0x2;
    /// The session was kicked by game logic.
    pub const KICKED_OUT: u8 = 0x4;
    /// The backend has bound a user to the session.
    pub const AUTHORIZED: u8 = 0x8;

    pub fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    #[cfg(test)]
    pub fn contains(&self, bit: u8) -> bool {
        self.0 & bit == bit
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}
