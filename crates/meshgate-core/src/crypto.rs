//! Header-protection seams and the standard provider.
//!
//! The codec and registries never touch cipher internals; they go through
//! [`HeaderCipher`] and [`CryptoProvider`]. The shipped [`StandardProvider`]
//! seals headers with ChaCha20-Poly1305, derives community keys from the
//! community name (so federated supernodes agree on them without key
//! exchange) and user keys from an X25519 agreement between the supernode's
//! static secret and the user's published public key.

use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::wire::{CommunityName, HEADER_SIZE, NONCE_SIZE, SEALED_HEADER_SIZE};

/// Length of user public keys in the ACL key files.
pub const USER_KEY_SIZE: usize = 32;

/// Seals and opens the 22-byte common header. Implementations must be
/// deterministic for a given (key, nonce) pair.
pub trait HeaderCipher: Send + Sync {
    fn seal(&self, nonce: &[u8; NONCE_SIZE], header: &[u8; HEADER_SIZE]) -> [u8; SEALED_HEADER_SIZE];

    fn open(&self, nonce: &[u8; NONCE_SIZE], sealed: &[u8; SEALED_HEADER_SIZE])
        -> Option<[u8; HEADER_SIZE]>;
}

/// Supplies every cryptographic primitive the core consumes: the name hash
/// behind auto-IP assignment and the header ciphers behind the
/// `static-key` and `user-password` encryption modes.
pub trait CryptoProvider: Send + Sync {
    /// 64-bit hash of an arbitrary byte string. Must be a pure function:
    /// auto-IP assignment depends on it being stable across restarts.
    fn name_hash64(&self, data: &[u8]) -> u64;

    /// Community-wide header cipher. Keyed by the community name alone, so
    /// every supernode in a federation derives the same cipher.
    fn community_cipher(&self, community: &CommunityName) -> Arc<dyn HeaderCipher>;

    /// Per-user header cipher for a `user-password` community.
    fn user_cipher(
        &self,
        community: &CommunityName,
        username: &str,
        public_key: &[u8; USER_KEY_SIZE],
    ) -> Arc<dyn HeaderCipher>;
}

// ── Standard provider ─────────────────────────────────────────────────────────

const COMMUNITY_KEY_CONTEXT: &str = "meshgate 2024-06 community header key";
const USER_KEY_CONTEXT: &str = "meshgate 2024-06 user header key";

pub struct StandardProvider {
    secret: StaticSecret,
}

impl StandardProvider {
    pub fn new(secret: [u8; 32]) -> Self {
        StandardProvider {
            secret: StaticSecret::from(secret),
        }
    }

    /// Fresh random identity. A supernode's user ciphers are bound to this
    /// identity for the lifetime of the process.
    pub fn generate() -> Self {
        Self::new(rand::random())
    }

    pub fn public_key(&self) -> [u8; 32] {
        *PublicKey::from(&self.secret).as_bytes()
    }
}

impl CryptoProvider for StandardProvider {
    fn name_hash64(&self, data: &[u8]) -> u64 {
        let digest = blake3::hash(data);
        let mut out = [0u8; 8];
        out.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_be_bytes(out)
    }

    fn community_cipher(&self, community: &CommunityName) -> Arc<dyn HeaderCipher> {
        let key = blake3::derive_key(COMMUNITY_KEY_CONTEXT, community.as_str().as_bytes());
        Arc::new(ChaChaHeaderCipher::new(key))
    }

    fn user_cipher(
        &self,
        community: &CommunityName,
        username: &str,
        public_key: &[u8; USER_KEY_SIZE],
    ) -> Arc<dyn HeaderCipher> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*public_key));
        let mut material = Vec::with_capacity(64 + username.len());
        material.extend_from_slice(shared.as_bytes());
        material.extend_from_slice(community.as_str().as_bytes());
        material.extend_from_slice(username.as_bytes());
        let key = blake3::derive_key(USER_KEY_CONTEXT, &material);
        Arc::new(ChaChaHeaderCipher::new(key))
    }
}

// ── ChaCha20-Poly1305 header cipher ───────────────────────────────────────────

struct ChaChaHeaderCipher {
    cipher: ChaCha20Poly1305,
}

impl ChaChaHeaderCipher {
    fn new(key: [u8; 32]) -> Self {
        ChaChaHeaderCipher {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    fn full_nonce(nonce: &[u8; NONCE_SIZE]) -> Nonce {
        let mut out = [0u8; 12];
        out[..NONCE_SIZE].copy_from_slice(nonce);
        Nonce::from(out)
    }
}

impl HeaderCipher for ChaChaHeaderCipher {
    fn seal(
        &self,
        nonce: &[u8; NONCE_SIZE],
        header: &[u8; HEADER_SIZE],
    ) -> [u8; SEALED_HEADER_SIZE] {
        let mut out = [0u8; SEALED_HEADER_SIZE];
        // Encrypting a fixed-size buffer with a valid key cannot fail.
        if let Ok(sealed) = self.cipher.encrypt(
            &Self::full_nonce(nonce),
            Payload {
                msg: header,
                aad: &[],
            },
        ) {
            out.copy_from_slice(&sealed);
        }
        out
    }

    fn open(
        &self,
        nonce: &[u8; NONCE_SIZE],
        sealed: &[u8; SEALED_HEADER_SIZE],
    ) -> Option<[u8; HEADER_SIZE]> {
        let opened = self
            .cipher
            .decrypt(
                &Self::full_nonce(nonce),
                Payload {
                    msg: sealed,
                    aad: &[],
                },
            )
            .ok()?;
        let mut out = [0u8; HEADER_SIZE];
        if opened.len() != HEADER_SIZE {
            return None;
        }
        out.copy_from_slice(&opened);
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> CommunityName {
        CommunityName::new(s).unwrap()
    }

    #[test]
    fn community_keys_agree_across_providers() {
        // Two supernodes with unrelated identities must derive the same
        // community cipher, or federation forwarding cannot be decoded.
        let a = StandardProvider::generate();
        let b = StandardProvider::generate();
        let header = [0x42u8; HEADER_SIZE];
        let nonce = [1, 2, 3, 4];

        let sealed = a.community_cipher(&name("alpha")).seal(&nonce, &header);
        let opened = b.community_cipher(&name("alpha")).open(&nonce, &sealed);
        assert_eq!(opened, Some(header));
    }

    #[test]
    fn different_communities_use_different_keys() {
        let p = StandardProvider::generate();
        let header = [0x42u8; HEADER_SIZE];
        let nonce = [0; NONCE_SIZE];

        let sealed = p.community_cipher(&name("alpha")).seal(&nonce, &header);
        assert_eq!(p.community_cipher(&name("beta")).open(&nonce, &sealed), None);
    }

    #[test]
    fn tampered_seal_fails_to_open() {
        let p = StandardProvider::generate();
        let cipher = p.community_cipher(&name("alpha"));
        let nonce = [7, 7, 7, 7];
        let mut sealed = cipher.seal(&nonce, &[0xAAu8; HEADER_SIZE]);
        sealed[5] ^= 0x01;
        assert_eq!(cipher.open(&nonce, &sealed), None);
    }

    #[test]
    fn user_cipher_is_deterministic_per_identity() {
        let p = StandardProvider::new([9u8; 32]);
        let pk = [3u8; 32];
        let header = [0x11u8; HEADER_SIZE];
        let nonce = [0, 0, 0, 1];

        let sealed = p.user_cipher(&name("alpha"), "mallory", &pk).seal(&nonce, &header);
        let again = p.user_cipher(&name("alpha"), "mallory", &pk);
        assert_eq!(again.open(&nonce, &sealed), Some(header));

        // A different username yields a different key even for the same pk.
        let other = p.user_cipher(&name("alpha"), "alice", &pk);
        assert_eq!(other.open(&nonce, &sealed), None);
    }

    #[test]
    fn name_hash_is_stable() {
        let a = StandardProvider::generate();
        let b = StandardProvider::generate();
        assert_eq!(a.name_hash64(b"alpha"), b.name_hash64(b"alpha"));
        assert_ne!(a.name_hash64(b"alpha"), a.name_hash64(b"beta"));
    }
}
