//! Channel keys of the relay transport
//!
//! Every relay channel derives one secret from its storage key. The secret
//! seeds an Ed25519 signing key (its public half names the relay topic) and a
//! ChaCha20-Poly1305 key that encrypts each record. Anyone who knows the
//! channel name can read and publish; the relay only checks that the publisher
//! knows it too.

use alloc::string::String;
use alloc::vec::Vec;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

use super::TYPE;
use crate::{BroadcastError, Result};

const NONCE_LEN: usize = 12;

/// Key material shared by every state of one relay channel
pub struct ChannelKeys {
    signing_key: SigningKey,
    cipher: ChaCha20Poly1305,
}

impl ChannelKeys {
    /// Derive the keys of the channel stored under `storage_key`
    pub fn derive(storage_key: &str) -> Self {
        let secret: [u8; 32] = Sha256::digest(storage_key.as_bytes()).into();
        Self {
            signing_key: SigningKey::from_bytes(&secret),
            cipher: ChaCha20Poly1305::new(Key::from_slice(&secret)),
        }
    }

    /// Hex public key, used as the relay topic
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Encrypt `plaintext` to hex of `nonce || ciphertext`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| BroadcastError::transport_send(TYPE, "record encryption failed"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(hex::encode(sealed))
    }

    pub fn decrypt(&self, sealed_hex: &str) -> Result<Vec<u8>> {
        let sealed = hex::decode(sealed_hex)
            .map_err(|e| BroadcastError::Serialization(format!("invalid record hex: {}", e)))?;
        if sealed.len() < NONCE_LEN {
            return Err(BroadcastError::Serialization("record too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| BroadcastError::Serialization("record decryption failed".into()))
    }

    /// Hex signature over `sha256(data)`
    pub fn sign(&self, data: &str) -> String {
        let digest = Sha256::digest(data.as_bytes());
        hex::encode(self.signing_key.sign(&digest).to_bytes())
    }
}

/// Check a publish signature produced by [`ChannelKeys::sign`]
pub fn verify(public_key_hex: &str, data: &str, signature_hex: &str) -> bool {
    let Some(public_key) = decode_array::<32>(public_key_hex) else {
        return false;
    };
    let Some(signature) = decode_array::<64>(signature_hex) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public_key) else {
        return false;
    };
    let digest = Sha256::digest(data.as_bytes());
    verifying_key
        .verify(&digest, &Signature::from_bytes(&signature))
        .is_ok()
}

fn decode_array<const N: usize>(value: &str) -> Option<[u8; N]> {
    hex::decode(value).ok()?.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_deterministic_per_channel() {
        let a = ChannelKeys::derive("pubkey.broadcastChannel-chat");
        let b = ChannelKeys::derive("pubkey.broadcastChannel-chat");
        let other = ChannelKeys::derive("pubkey.broadcastChannel-other");
        assert_eq!(a.public_key_hex(), b.public_key_hex());
        assert_ne!(a.public_key_hex(), other.public_key_hex());
        assert_eq!(a.public_key_hex().len(), 64);
    }

    #[test]
    fn test_records_open_only_with_the_same_channel_key() {
        let keys = ChannelKeys::derive("pubkey.broadcastChannel-chat");
        let sealed = keys.encrypt(br#"{"text":"hi"}"#).unwrap();
        // fresh nonce per record
        assert_ne!(sealed, keys.encrypt(br#"{"text":"hi"}"#).unwrap());

        let reader = ChannelKeys::derive("pubkey.broadcastChannel-chat");
        assert_eq!(reader.decrypt(&sealed).unwrap(), br#"{"text":"hi"}"#.to_vec());

        let stranger = ChannelKeys::derive("pubkey.broadcastChannel-other");
        assert!(stranger.decrypt(&sealed).is_err());
        assert!(reader.decrypt("abcd").is_err());
    }

    #[test]
    fn test_each_record_draws_a_full_random_nonce() {
        let keys = ChannelKeys::derive("pubkey.broadcastChannel-chat");
        let nonces: Vec<Vec<u8>> = (0..64)
            .map(|_| {
                let sealed = hex::decode(keys.encrypt(b"same").unwrap()).unwrap();
                assert_eq!(keys.decrypt(&hex::encode(&sealed)).unwrap(), b"same".to_vec());
                sealed[..NONCE_LEN].to_vec()
            })
            .collect();

        let distinct: hashbrown::HashSet<&Vec<u8>> = nonces.iter().collect();
        assert_eq!(distinct.len(), nonces.len());
        // a uuid v4 pins the high nibble of byte 6; random nonces vary there
        let version_nibbles: hashbrown::HashSet<u8> = nonces.iter().map(|n| n[6] >> 4).collect();
        assert!(version_nibbles.len() > 1);
    }

    #[test]
    fn test_signature_verification() {
        let keys = ChannelKeys::derive("pubkey.broadcastChannel-chat");
        let signature = keys.sign("payload");
        assert!(verify(&keys.public_key_hex(), "payload", &signature));
        assert!(!verify(&keys.public_key_hex(), "tampered", &signature));

        let other = ChannelKeys::derive("pubkey.broadcastChannel-other");
        assert!(!verify(&other.public_key_hex(), "payload", &signature));
        assert!(!verify("zz", "payload", &signature));
    }
}
