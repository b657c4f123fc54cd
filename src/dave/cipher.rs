// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The AEAD primitives media encryption is built on.
//!
//! Both the transport layer (XChaCha20-Poly1305 with a 24 byte nonce and the
//! full 16 byte Poly1305 tag) and the DAVE frame layer (AES-128-GCM with a
//! 12 byte nonce and a tag truncated to 8 bytes on the wire) sit behind the
//! same [AeadCipher] interface. Concrete ciphers are chosen once at session
//! construction and never change for the lifetime of a key.

use aes_gcm::{
    aead::generic_array::typenum::{U12, U8},
    aead::generic_array::GenericArray,
    aead::AeadInPlace,
    aes::Aes128,
    AesGcm, KeyInit,
};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use log::*;
use zeroize::Zeroizing;

/// AES-128-GCM parameterized with the truncated 8 byte tag DAVE carries on
/// the wire.
type Aes128Gcm8 = AesGcm<Aes128, U12, U8>;

/// A detached-mode AEAD.
///
/// Both operations report success as a bool; a failed decrypt carries no
/// more information than "the tag did not verify", which is all callers need.
pub trait AeadCipher: Send + Sync {
    /// Encrypts `plaintext` into `ciphertext_out` (same length), writing the
    /// authentication tag to `tag_out`.
    fn encrypt(
        &self,
        ciphertext_out: &mut [u8],
        plaintext: &[u8],
        nonce: &[u8],
        additional_data: &[u8],
        tag_out: &mut [u8],
    ) -> bool;

    /// Decrypts `ciphertext` into `plaintext_out` (same length), verifying
    /// `tag` over the ciphertext and `additional_data`.
    fn decrypt(
        &self,
        plaintext_out: &mut [u8],
        ciphertext: &[u8],
        tag: &[u8],
        nonce: &[u8],
        additional_data: &[u8],
    ) -> bool;
}

/// The DAVE frame cipher: AES-128-GCM with an 8 byte truncated tag.
pub struct Aes128GcmCipher {
    cipher: Aes128Gcm8,
}

impl Aes128GcmCipher {
    /// Creates a cipher from a 16 byte ratchet key.
    pub fn new(key: &Zeroizing<Vec<u8>>) -> Option<Aes128GcmCipher> {
        if key.len() != super::AES_GCM_128_KEY_BYTES {
            warn!("DAVE: Refusing to build AES-GCM cipher from key of size {}", key.len());
            return None;
        }

        Some(Aes128GcmCipher {
            cipher: Aes128Gcm8::new(GenericArray::from_slice(key)),
        })
    }
}

impl AeadCipher for Aes128GcmCipher {
    fn encrypt(
        &self,
        ciphertext_out: &mut [u8],
        plaintext: &[u8],
        nonce: &[u8],
        additional_data: &[u8],
        tag_out: &mut [u8],
    ) -> bool {
        if ciphertext_out.len() != plaintext.len()
            || nonce.len() != super::AES_GCM_128_NONCE_BYTES
            || tag_out.len() != super::AES_GCM_127_TRUNCATED_TAG_BYTES
        {
            return false;
        }

        ciphertext_out.copy_from_slice(plaintext);

        match self.cipher.encrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            additional_data,
            ciphertext_out,
        ) {
            Ok(tag) => {
                tag_out.copy_from_slice(&tag);
                true
            }
            Err(_) => false,
        }
    }

    fn decrypt(
        &self,
        plaintext_out: &mut [u8],
        ciphertext: &[u8],
        tag: &[u8],
        nonce: &[u8],
        additional_data: &[u8],
    ) -> bool {
        if plaintext_out.len() != ciphertext.len()
            || nonce.len() != super::AES_GCM_128_NONCE_BYTES
            || tag.len() != super::AES_GCM_127_TRUNCATED_TAG_BYTES
        {
            return false;
        }

        plaintext_out.copy_from_slice(ciphertext);

        self.cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                additional_data,
                plaintext_out,
                GenericArray::from_slice(tag),
            )
            .is_ok()
    }
}

/// The transport cipher: XChaCha20-Poly1305.
///
/// The HChaCha20 subkey derivation over the first 16 nonce bytes happens
/// inside the `chacha20poly1305` crate; callers only ever see the 24 byte
/// extended nonce.
pub struct XChaCha20Poly1305Cipher {
    cipher: XChaCha20Poly1305,
}

impl XChaCha20Poly1305Cipher {
    /// Creates a cipher from the 32 byte transport secret key.
    pub fn new(key: &[u8; 32]) -> XChaCha20Poly1305Cipher {
        XChaCha20Poly1305Cipher {
            cipher: XChaCha20Poly1305::new(GenericArray::from_slice(key)),
        }
    }
}

impl AeadCipher for XChaCha20Poly1305Cipher {
    fn encrypt(
        &self,
        ciphertext_out: &mut [u8],
        plaintext: &[u8],
        nonce: &[u8],
        additional_data: &[u8],
        tag_out: &mut [u8],
    ) -> bool {
        if ciphertext_out.len() != plaintext.len() || nonce.len() != 24 || tag_out.len() != 16 {
            return false;
        }

        ciphertext_out.copy_from_slice(plaintext);

        match self.cipher.encrypt_in_place_detached(
            XNonce::from_slice(nonce),
            additional_data,
            ciphertext_out,
        ) {
            Ok(tag) => {
                tag_out.copy_from_slice(&tag);
                true
            }
            Err(_) => false,
        }
    }

    fn decrypt(
        &self,
        plaintext_out: &mut [u8],
        ciphertext: &[u8],
        tag: &[u8],
        nonce: &[u8],
        additional_data: &[u8],
    ) -> bool {
        if plaintext_out.len() != ciphertext.len() || nonce.len() != 24 || tag.len() != 16 {
            return false;
        }

        plaintext_out.copy_from_slice(ciphertext);

        self.cipher
            .decrypt_in_place_detached(
                XNonce::from_slice(nonce),
                additional_data,
                plaintext_out,
                GenericArray::from_slice(tag),
            )
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_gcm_roundtrip() {
        let key = Zeroizing::new(vec![0u8; 16]);
        let cipher = Aes128GcmCipher::new(&key).unwrap();

        let plaintext = b"opus frame bytes";
        let nonce = [0u8; 12];
        let aad = b"unencrypted header";

        let mut ciphertext = vec![0u8; plaintext.len()];
        let mut tag = [0u8; 8];
        assert!(cipher.encrypt(&mut ciphertext, plaintext, &nonce, aad, &mut tag));
        assert_ne!(&ciphertext[..], &plaintext[..]);

        let mut decrypted = vec![0u8; plaintext.len()];
        assert!(cipher.decrypt(&mut decrypted, &ciphertext, &tag, &nonce, aad));
        assert_eq!(&decrypted[..], &plaintext[..]);
    }

    #[test]
    fn aes_gcm_rejects_wrong_tag_and_aad() {
        let key = Zeroizing::new(vec![7u8; 16]);
        let cipher = Aes128GcmCipher::new(&key).unwrap();

        let plaintext = b"frame";
        let nonce = [1u8; 12];
        let mut ciphertext = vec![0u8; plaintext.len()];
        let mut tag = [0u8; 8];
        assert!(cipher.encrypt(&mut ciphertext, plaintext, &nonce, b"aad", &mut tag));

        let mut out = vec![0u8; plaintext.len()];
        let mut bad_tag = tag;
        bad_tag[0] ^= 0xff;
        assert!(!cipher.decrypt(&mut out, &ciphertext, &bad_tag, &nonce, b"aad"));
        assert!(!cipher.decrypt(&mut out, &ciphertext, &tag, &nonce, b"other aad"));
    }

    #[test]
    fn aes_gcm_rejects_bad_key_size() {
        assert!(Aes128GcmCipher::new(&Zeroizing::new(vec![0u8; 32])).is_none());
    }

    #[test]
    fn xchacha_roundtrip() {
        let cipher = XChaCha20Poly1305Cipher::new(&[0u8; 32]);

        let plaintext = b"rtp payload";
        let mut nonce = [0u8; 24];
        nonce[3] = 1;

        let mut ciphertext = vec![0u8; plaintext.len()];
        let mut tag = [0u8; 16];
        assert!(cipher.encrypt(&mut ciphertext, plaintext, &nonce, b"rtp header", &mut tag));

        let mut decrypted = vec![0u8; plaintext.len()];
        assert!(cipher.decrypt(&mut decrypted, &ciphertext, &tag, &nonce, b"rtp header"));
        assert_eq!(&decrypted[..], &plaintext[..]);

        // flipping a nonce byte must break the tag
        nonce[0] ^= 1;
        assert!(!cipher.decrypt(&mut decrypted, &ciphertext, &tag, &nonce, b"rtp header"));
    }
}
