//! Key agreement and encrypted sub-packet envelope (§3/§4.B).
//!
//! The vendor's real Diffie-Hellman parameters and stream cipher are
//! proprietary and explicitly out of scope (spec.md §1). This module keeps
//! the *shape* the protocol requires — a 64-bit shared secret folded into a
//! 128-bit session key, an encrypted sub-packet with a monotonic counter
//! and randomized padding — while substituting real, standard primitives
//! for the unpublished vendor ones: textbook modular-exponentiation DH over
//! a 64-bit prime field, and AES-128 in CTR mode for the cipher. See
//! DESIGN.md for the substitution rationale.

use aes::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use thiserror::Error;

use super::crc::crc16;

type Aes128Ctr = ctr::Ctr64BE<aes::Aes128>;

/// High 64 bits of the 128-bit session key; fixed per spec.md §3 ("fixed
/// key high half concatenated with the DH shared secret").
pub const FIXED_KEY_HI: u64 = 0x0123_4567_89AB_CDEF;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encrypted sub-packet too short: {0} bytes")]
    TooShort(usize),
    #[error("encrypted sub-packet crc mismatch: expected {expected:#06x}, calculated {calculated:#06x}")]
    CrcMismatch { expected: u16, calculated: u16 },
    #[error("encrypted sub-packet declares length {declared} but only {available} bytes follow")]
    LengthMismatch { declared: usize, available: usize },
}

/// Diffie-Hellman key agreement, abstracted so a vendor-exact
/// implementation can be swapped in without touching the session layer.
pub trait KeyAgreement {
    /// Generate this side's private key and the public value to send.
    fn generate(&mut self, generator: u64, modulus: u64) -> (u64 /* private */, u64 /* public */);
    /// Combine our private key with the peer's public value.
    fn shared_secret(&self, private: u64, modulus: u64, peer_public: u64) -> u64;
}

/// Textbook modexp DH over `u128` intermediate products (inputs/outputs are
/// `u64`, matching the protocol's 64-bit generator/modulus/key fields).
#[derive(Debug, Default)]
pub struct ModExpKeyAgreement;

impl KeyAgreement for ModExpKeyAgreement {
    fn generate(&mut self, generator: u64, modulus: u64) -> (u64, u64) {
        let private = rand::thread_rng().next_u64() % modulus.max(2);
        let public = mod_pow(generator, private, modulus);
        (private, public)
    }

    fn shared_secret(&self, private: u64, modulus: u64, peer_public: u64) -> u64 {
        mod_pow(peer_public, private, modulus)
    }
}

fn mod_pow(mut base: u64, mut exp: u64, modulus: u64) -> u64 {
    if modulus == 1 {
        return 0;
    }
    let mut result: u128 = 1;
    base %= modulus;
    let modulus = modulus as u128;
    let mut base = base as u128;
    while exp > 0 {
        if exp & 1 == 1 {
            result = (result * base) % modulus;
        }
        exp >>= 1;
        base = (base * base) % modulus;
    }
    result as u64
}

/// Derive the 128-bit session key from the DH shared secret.
pub fn derive_session_key(shared_secret: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&FIXED_KEY_HI.to_be_bytes());
    key[8..].copy_from_slice(&shared_secret.to_be_bytes());
    key
}

/// Stream/block cipher keyed by the negotiated session key, applied over
/// the encrypted sub-packet's data region.
pub trait SspCipher {
    fn apply_keystream(&self, nonce: u64, data: &mut [u8]);
}

/// AES-128-CTR standing in for the vendor's stream cipher; the nonce
/// (derived from the per-direction counter) becomes the CTR initial
/// counter block.
#[derive(Debug, Clone)]
pub struct Aes128CtrCipher {
    key: [u8; 16],
}

impl Aes128CtrCipher {
    pub fn new(key: [u8; 16]) -> Self {
        Self { key }
    }
}

impl SspCipher for Aes128CtrCipher {
    fn apply_keystream(&self, nonce: u64, data: &mut [u8]) {
        let mut iv = [0u8; 16];
        iv[8..].copy_from_slice(&nonce.to_be_bytes());
        let mut cipher = Aes128Ctr::new((&self.key).into(), (&iv).into());
        cipher.apply_keystream(data);
    }
}

/// The plaintext envelope wrapped inside an encrypted packet's payload
/// (spec.md §3): a length, a monotonic per-direction counter, the caller's
/// data, randomized padding out to an 8-byte boundary, and a CRC16 over
/// everything preceding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedSubPacket {
    pub count: u32,
    pub data: Vec<u8>,
}

impl EncryptedSubPacket {
    /// Serialize to the plaintext form, pad to an 8-byte boundary with
    /// random bytes, and append the CRC16. This is the buffer that gets
    /// encrypted in place before being wrapped in an outer [`Packet`].
    ///
    /// [`Packet`]: super::frame::Packet
    pub fn encode_plaintext(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(1 + 4 + self.data.len());
        body.push(self.data.len() as u8);
        body.extend_from_slice(&self.count.to_le_bytes());
        body.extend_from_slice(&self.data);

        let unpadded_len = body.len() + 2; // + crc16
        let padded_len = unpadded_len.div_ceil(8) * 8;
        let pad_len = padded_len - unpadded_len;
        let mut padding = vec![0u8; pad_len];
        rand::thread_rng().fill_bytes(&mut padding);
        body.extend_from_slice(&padding);

        let crc = crc16(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        body
    }

    /// Parse a decrypted buffer back into an [`EncryptedSubPacket`],
    /// verifying its CRC and ignoring the trailing padding.
    pub fn decode_plaintext(buf: &[u8]) -> Result<Self, CryptoError> {
        if buf.len() < 1 + 4 + 2 {
            return Err(CryptoError::TooShort(buf.len()));
        }
        let crc_at = buf.len() - 2;
        let expected = u16::from_le_bytes([buf[crc_at], buf[crc_at + 1]]);
        let calculated = crc16(&buf[..crc_at]);
        if expected != calculated {
            return Err(CryptoError::CrcMismatch {
                expected,
                calculated,
            });
        }
        let declared = buf[0] as usize;
        let count = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let available = crc_at - 5;
        if declared > available {
            return Err(CryptoError::LengthMismatch {
                declared,
                available,
            });
        }
        Ok(Self {
            count,
            data: buf[5..5 + declared].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modexp_dh_agrees_on_both_sides() {
        let generator = 7u64;
        let modulus = 0xFFFF_FFFB; // a prime below 2^32, fits u64 modexp comfortably
        let mut host = ModExpKeyAgreement;
        let mut device = ModExpKeyAgreement;
        let (host_priv, host_pub) = host.generate(generator, modulus);
        let (device_priv, device_pub) = device.generate(generator, modulus);
        let host_secret = host.shared_secret(host_priv, modulus, device_pub);
        let device_secret = device.shared_secret(device_priv, modulus, host_pub);
        assert_eq!(host_secret, device_secret);
    }

    #[test]
    fn session_key_carries_fixed_high_half() {
        let key = derive_session_key(0xDEAD_BEEF_0000_0001);
        assert_eq!(&key[..8], &FIXED_KEY_HI.to_be_bytes());
        assert_eq!(&key[8..], &0xDEAD_BEEF_0000_0001u64.to_be_bytes());
    }

    #[test]
    fn cipher_roundtrips_in_place() {
        let cipher = Aes128CtrCipher::new([0x42; 16]);
        let mut data = b"enable-payout".to_vec();
        let original = data.clone();
        cipher.apply_keystream(7, &mut data);
        assert_ne!(data, original);
        cipher.apply_keystream(7, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn encrypted_subpacket_roundtrip() {
        let sub = EncryptedSubPacket {
            count: 42,
            data: vec![0x01, 0x02, 0x03],
        };
        let plain = sub.encode_plaintext();
        assert_eq!(plain.len() % 8, 0);
        let decoded = EncryptedSubPacket::decode_plaintext(&plain).unwrap();
        assert_eq!(decoded, sub);
    }

    #[test]
    fn encrypted_subpacket_rejects_bad_crc() {
        let sub = EncryptedSubPacket {
            count: 1,
            data: vec![0xAA],
        };
        let mut plain = sub.encode_plaintext();
        let last = plain.len() - 1;
        plain[last] ^= 0xFF;
        assert!(matches!(
            EncryptedSubPacket::decode_plaintext(&plain),
            Err(CryptoError::CrcMismatch { .. })
        ));
    }
}
