//! The Bloom filter published as a dialing mailbox.
//!
//! The last mix server folds every dial token destined for a mailbox into a
//! filter; clients test the tokens they share with each friend. Tokens are
//! keyed HMAC outputs, so their distribution is uniform and index derivation
//! can simply hash the token with a counter.

use std::convert::TryInto;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::{
    crypto::{ByteObject, Sha256},
    message::{DecodeError, DIAL_TOKEN_LENGTH},
};

/// Number of filter bits per inserted token.
const BITS_PER_TOKEN: usize = 10;

/// Number of index derivations per token.
const NUM_HASHES: u32 = 7;

/// Smallest filter size in bits, so an empty mailbox still serializes to
/// something testable.
const MIN_BITS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A fixed-size Bloom filter over 32-byte dial tokens.
pub struct BloomFilter {
    num_bits: u32,
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Creates an empty filter sized for `capacity` tokens.
    pub fn new(capacity: usize) -> Self {
        let num_bits = (capacity * BITS_PER_TOKEN).max(MIN_BITS);
        Self {
            num_bits: num_bits as u32,
            bits: vec![0_u8; (num_bits + 7) / 8],
        }
    }

    fn indexes(&self, token: &[u8; DIAL_TOKEN_LENGTH]) -> impl Iterator<Item = usize> + '_ {
        let num_bits = self.num_bits as u64;
        let token = *token;
        (0..NUM_HASHES).map(move |i| {
            let mut message = i.to_be_bytes().to_vec();
            message.extend_from_slice(&token);
            let digest = Sha256::hash(&message);
            // unwrap safe: a SHA256 digest is longer than 8 bytes
            let value = u64::from_be_bytes(digest.as_slice()[..8].try_into().unwrap());
            (value % num_bits) as usize
        })
    }

    /// Inserts a token.
    pub fn insert(&mut self, token: &[u8; DIAL_TOKEN_LENGTH]) {
        let indexes: Vec<usize> = self.indexes(token).collect();
        for index in indexes {
            self.bits[index / 8] |= 1 << (index % 8);
        }
    }

    /// Tests a token. False positives occur at the configured rate, false
    /// negatives never.
    pub fn test(&self, token: &[u8; DIAL_TOKEN_LENGTH]) -> bool {
        self.indexes(token)
            .all(|index| self.bits[index / 8] & (1 << (index % 8)) != 0)
    }

    /// Serializes the filter: `BE_u32(num_bits) || bits`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.bits.len());
        out.extend_from_slice(&self.num_bits.to_be_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    /// Deserializes a filter produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    /// Fails if the header is truncated or the bit vector length does not
    /// match the declared size.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < 4 {
            return Err(anyhow!("invalid buffer length: {} < 4", bytes.len()));
        }
        let num_bits = u32::from_be_bytes(bytes[..4].try_into().context("truncated header")?);
        if num_bits == 0 {
            return Err(anyhow!("empty bloom filter"));
        }
        let expected = (num_bits as usize + 7) / 8;
        let bits = bytes[4..].to_vec();
        if bits.len() != expected {
            return Err(anyhow!(
                "invalid bit vector length: {} != {}",
                bits.len(),
                expected
            ));
        }
        Ok(Self { num_bits, bits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(byte: u8) -> [u8; DIAL_TOKEN_LENGTH] {
        [byte; DIAL_TOKEN_LENGTH]
    }

    #[test]
    fn inserted_tokens_always_test_positive() {
        let mut filter = BloomFilter::new(16);
        for i in 0..16 {
            filter.insert(&token(i));
        }
        for i in 0..16 {
            assert!(filter.test(&token(i)));
        }
    }

    #[test]
    fn absent_tokens_mostly_test_negative() {
        let mut filter = BloomFilter::new(16);
        for i in 0..16 {
            filter.insert(&token(i));
        }
        let misses = (16..255).filter(|&i| !filter.test(&token(i))).count();
        // the false-positive rate at 10 bits/token is well under 1%
        assert!(misses >= 230);
    }

    #[test]
    fn serialization_round_trip() {
        let mut filter = BloomFilter::new(4);
        filter.insert(&token(1));
        let bytes = filter.to_bytes();
        assert_eq!(BloomFilter::from_bytes(&bytes).unwrap(), filter);
    }

    #[test]
    fn empty_capacity_still_works() {
        let filter = BloomFilter::new(0);
        assert!(!filter.test(&token(1)));
        BloomFilter::from_bytes(&filter.to_bytes()).unwrap();
    }

    #[test]
    fn malformed_buffers_are_rejected() {
        assert!(BloomFilter::from_bytes(&[0, 0]).is_err());
        assert!(BloomFilter::from_bytes(&[0, 0, 0, 64, 1, 2]).is_err());
    }
}
