// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-generation symmetric key derivation.
//!
//! Every sender has a key ratchet: a one-way chain of secrets indexed by a
//! generation counter. Generation `n + 1` is derived from generation `n`, so
//! deleting an old generation gives forward secrecy while still letting
//! receivers that are slightly behind catch up.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use log::*;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::AES_GCM_128_KEY_BYTES;

/// Generation counter of a ratchet key, the high 8 bits of the truncated
/// packet nonce.
pub type KeyGeneration = u32;

/// A source of per-generation media keys.
pub trait KeyRatchet: Send {
    /// Derives the 16 byte media key for `generation`.
    ///
    /// Keys are usually requested monotonically but may be requested out of
    /// order within a small window. Returns [None] once the generation has
    /// been deleted.
    fn get_key(&mut self, generation: KeyGeneration) -> Option<Zeroizing<Vec<u8>>>;

    /// Irreversibly deletes the chain secret for `generation`.
    fn delete_key(&mut self, generation: KeyGeneration);
}

/// HKDF-Expand with the MLS label framing
/// (`struct { uint16 length; opaque label<V>; opaque context<V> }` where the
/// label is prefixed with `"MLS 1.0 "`).
fn expand_with_label(
    secret: &[u8],
    label: &str,
    context: &[u8],
    length: usize,
) -> Zeroizing<Vec<u8>> {
    let mut info = Vec::with_capacity(2 + 1 + 8 + label.len() + 1 + context.len());
    info.extend_from_slice(&(length as u16).to_be_bytes());
    let full_label_len = "MLS 1.0 ".len() + label.len();
    info.push(full_label_len as u8);
    info.extend_from_slice(b"MLS 1.0 ");
    info.extend_from_slice(label.as_bytes());
    info.push(context.len() as u8);
    info.extend_from_slice(context);

    // HKDF-Expand (RFC 5869) over HMAC-SHA256, done by hand because the
    // chain secrets are shorter than the hash output
    let mut okm = Zeroizing::new(Vec::with_capacity(length));
    let mut previous: Vec<u8> = Vec::new();
    let mut counter: u8 = 1;
    while okm.len() < length {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret)
            .expect("HMAC accepts keys of any size");
        mac.update(&previous);
        mac.update(&info);
        mac.update(&[counter]);
        previous = mac.finalize().into_bytes().to_vec();
        let take = usize::min(length - okm.len(), previous.len());
        okm.extend_from_slice(&previous[..take]);
        counter += 1;
    }
    okm
}

/// The MLS-backed hash ratchet.
///
/// Seeded with a secret exported from the MLS group for one user; chain
/// secrets are cached per generation so that keys can be served out of order
/// until [KeyRatchet::delete_key] is called for them.
pub struct MlsKeyRatchet {
    chain_secrets: BTreeMap<KeyGeneration, Zeroizing<Vec<u8>>>,
}

impl MlsKeyRatchet {
    pub fn new(base_secret: Zeroizing<Vec<u8>>) -> MlsKeyRatchet {
        let mut chain_secrets = BTreeMap::new();
        chain_secrets.insert(0, base_secret);
        MlsKeyRatchet { chain_secrets }
    }

    /// Makes sure the chain secret for `generation` is cached, advancing the
    /// chain from the newest cached predecessor.
    fn advance_to(&mut self, generation: KeyGeneration) -> bool {
        if self.chain_secrets.contains_key(&generation) {
            return true;
        }

        let Some((&from, _)) = self.chain_secrets.range(..generation).next_back() else {
            // every predecessor was deleted, the chain cannot go backwards
            return false;
        };

        for current in from..generation {
            let secret = self.chain_secrets[&current].clone();
            let next = expand_with_label(&secret, "secret", &[], secret.len());
            self.chain_secrets.insert(current + 1, next);
        }

        true
    }
}

impl KeyRatchet for MlsKeyRatchet {
    fn get_key(&mut self, generation: KeyGeneration) -> Option<Zeroizing<Vec<u8>>> {
        trace!("DAVE: Retrieving key for generation {generation} from hash ratchet");

        if !self.advance_to(generation) {
            warn!("DAVE: Failed to retrieve key for deleted generation {generation}");
            return None;
        }

        let secret = &self.chain_secrets[&generation];
        Some(expand_with_label(secret, "key", &[], AES_GCM_128_KEY_BYTES))
    }

    fn delete_key(&mut self, generation: KeyGeneration) {
        // derive the successor first so the chain stays walkable
        self.advance_to(generation + 1);
        self.chain_secrets.remove(&generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ratchet() -> MlsKeyRatchet {
        MlsKeyRatchet::new(Zeroizing::new(vec![0x42; 16]))
    }

    #[test]
    fn keys_are_deterministic_and_distinct() {
        let mut a = ratchet();
        let mut b = ratchet();

        let key0 = a.get_key(0).unwrap();
        assert_eq!(key0.len(), AES_GCM_128_KEY_BYTES);
        assert_eq!(&*key0, &*b.get_key(0).unwrap());

        let key5 = a.get_key(5).unwrap();
        assert_eq!(&*key5, &*b.get_key(5).unwrap());
        assert_ne!(&*key0, &*key5);
    }

    #[test]
    fn out_of_order_requests() {
        let mut a = ratchet();
        let mut b = ratchet();

        // request 3 first, then 1; both must match in-order derivation
        let key3 = a.get_key(3).unwrap();
        let key1 = a.get_key(1).unwrap();

        assert_eq!(&*b.get_key(1).unwrap(), &*key1);
        assert_eq!(&*b.get_key(3).unwrap(), &*key3);
    }

    #[test]
    fn deleted_generations_are_unrecoverable() {
        let mut r = ratchet();
        let key1_before = r.get_key(1).unwrap();

        r.delete_key(0);
        r.delete_key(1);

        assert!(r.get_key(0).is_none());
        assert!(r.get_key(1).is_none());

        // later generations still derive
        let key2 = r.get_key(2).unwrap();
        assert_ne!(&*key1_before, &*key2);
    }
}
