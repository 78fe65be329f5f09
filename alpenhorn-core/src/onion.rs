//! Layered onion encryption for the mix cascade.
//!
//! Layer `i` is produced by generating a fresh ephemeral `C25519` key pair,
//! encrypting the inner plaintext to server `i`'s round onion key under the
//! fixed zero nonce, and prepending the ephemeral public key. The zero nonce
//! is safe because every ephemeral key encrypts exactly one message. Each
//! layer adds [`ONION_OVERHEAD`] bytes, so every onion entering mix position
//! `p` of an `M`-server cascade has length `(M - p) * ONION_OVERHEAD +
//! message_size` and the sizes alone reveal nothing about the sender.

use crate::crypto::{DecryptionError, PublicEncryptKey, SealedBox, SecretEncryptKey};

/// Number of bytes added per onion layer: a 32-byte ephemeral public key and
/// a 16-byte authenticator tag.
pub const ONION_OVERHEAD: usize = 48;

/// Wraps `message` for a cascade, innermost layer first for the *last* key.
///
/// `onion_keys` is ordered by cascade position; the result must be handed to
/// the server holding `onion_keys[0]`.
pub fn seal(message: &[u8], onion_keys: &[PublicEncryptKey]) -> Vec<u8> {
    let mut onion = message.to_vec();
    for key in onion_keys.iter().rev() {
        onion = SealedBox::seal(key, &onion);
    }
    onion
}

/// Removes one layer with the server's round secret key.
///
/// # Errors
/// Fails if the onion is shorter than one layer or the box does not open
/// under this key.
pub fn peel(onion: &[u8], secret: &SecretEncryptKey) -> Result<Vec<u8>, DecryptionError> {
    SealedBox::open(secret, onion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptKeyPair;

    #[test]
    fn seal_adds_fixed_overhead_per_layer() {
        let servers: Vec<EncryptKeyPair> = (0..3).map(|_| EncryptKeyPair::generate()).collect();
        let keys: Vec<_> = servers.iter().map(|s| s.public).collect();
        let message = vec![0xab; 36];
        let onion = seal(&message, &keys);
        assert_eq!(onion.len(), message.len() + 3 * ONION_OVERHEAD);
    }

    #[test]
    fn peel_recovers_the_message_in_cascade_order() {
        let servers: Vec<EncryptKeyPair> = (0..3).map(|_| EncryptKeyPair::generate()).collect();
        let keys: Vec<_> = servers.iter().map(|s| s.public).collect();
        let message = b"mix message".to_vec();

        let mut onion = seal(&message, &keys);
        for (position, server) in servers.iter().enumerate() {
            onion = peel(&onion, &server.secret).unwrap();
            let remaining = servers.len() - position - 1;
            assert_eq!(onion.len(), message.len() + remaining * ONION_OVERHEAD);
        }
        assert_eq!(onion, message);
    }

    #[test]
    fn peel_out_of_order_fails() {
        let servers: Vec<EncryptKeyPair> = (0..2).map(|_| EncryptKeyPair::generate()).collect();
        let keys: Vec<_> = servers.iter().map(|s| s.public).collect();
        let onion = seal(b"mix message", &keys);
        assert!(peel(&onion, &servers[1].secret).is_err());
    }

    #[test]
    fn peel_rejects_truncated_onions() {
        let server = EncryptKeyPair::generate();
        assert!(peel(&[0_u8; 31], &server.secret).is_err());
    }
}
