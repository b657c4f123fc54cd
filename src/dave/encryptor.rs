// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Encrypts outbound media frames under the local user's key ratchet and
//! appends the DAVE supplemental trailer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use log::*;

use crate::errors::DaveError;

use super::cipher::{AeadCipher, Aes128GcmCipher};
use super::codec_utils;
use super::cryptor_manager::compute_wrapped_generation;
use super::frame_processors::OutboundFrameProcessor;
use super::ranges::{serialize_unencrypted_ranges, unencrypted_ranges_size};
use super::ratchet::{KeyGeneration, KeyRatchet};
use super::{
    Codec, MediaType, AES_GCM_128_NONCE_BYTES, AES_GCM_127_TRUNCATED_TAG_BYTES,
    MARKER_BYTES, RATCHET_GENERATION_SHIFT_BITS, SUPPLEMENTAL_BYTES,
};
use super::leb128::{leb128_size, write_leb128};

/// How many times we re-roll the nonce when the ciphertext happens to contain
/// a byte sequence the packetizer would mangle.
const MAX_CIPHERTEXT_VALIDATION_RETRIES: u32 = 10;

#[derive(Debug, Default, Clone, Copy)]
pub struct EncryptionStats {
    pub passthroughs: u64,
    pub encrypt_success: u64,
    pub encrypt_failure: u64,
    pub encrypt_attempts: u64,
    pub encrypt_max_attempts: u64,
}

struct KeyState {
    ratchet: Option<Box<dyn KeyRatchet>>,
    cryptor: Option<Arc<Aes128GcmCipher>>,
    current_key_generation: KeyGeneration,
    truncated_nonce: u32,
}

/// The outbound half of DAVE frame encryption.
///
/// One encryptor exists per session; it is bound to the local user's key
/// ratchet on every execute transition and consulted by the send path for
/// every frame.
pub struct Encryptor {
    passthrough_mode: AtomicBool,
    key_state: Mutex<KeyState>,
    frame_processors: Mutex<Vec<OutboundFrameProcessor>>,
    ssrc_codec_pairs: Mutex<Vec<(u32, Codec)>>,
    stats: Mutex<[EncryptionStats; 2]>,
}

impl Default for Encryptor {
    fn default() -> Self {
        Encryptor::new()
    }
}

impl Encryptor {
    pub fn new() -> Encryptor {
        Encryptor {
            passthrough_mode: AtomicBool::new(false),
            key_state: Mutex::new(KeyState {
                ratchet: None,
                cryptor: None,
                current_key_generation: 0,
                truncated_nonce: 0,
            }),
            frame_processors: Mutex::new(Vec::new()),
            ssrc_codec_pairs: Mutex::new(Vec::new()),
            stats: Mutex::new([EncryptionStats::default(); 2]),
        }
    }

    /// Binds a new key ratchet; resets generation and nonce so the key
    /// stream starts fresh.
    pub fn set_key_ratchet(&self, ratchet: Box<dyn KeyRatchet>) {
        let mut state = self.key_state.lock().expect("key state mutex poisoned");
        state.ratchet = Some(ratchet);
        state.cryptor = None;
        state.current_key_generation = 0;
        state.truncated_nonce = 0;
    }

    pub fn has_key_ratchet(&self) -> bool {
        self.key_state
            .lock()
            .expect("key state mutex poisoned")
            .ratchet
            .is_some()
    }

    /// Passthrough sends frames without end-to-end encryption; used while a
    /// downgrade to protocol version 0 is in flight.
    pub fn set_passthrough_mode(&self, passthrough_mode: bool) {
        self.passthrough_mode
            .store(passthrough_mode, Ordering::Relaxed);
    }

    pub fn is_passthrough_mode(&self) -> bool {
        self.passthrough_mode.load(Ordering::Relaxed)
    }

    pub fn assign_ssrc_to_codec(&self, ssrc: u32, codec: Codec) {
        let mut pairs = self
            .ssrc_codec_pairs
            .lock()
            .expect("ssrc codec mutex poisoned");
        if let Some(pair) = pairs.iter_mut().find(|(s, _)| *s == ssrc) {
            pair.1 = codec;
        } else {
            pairs.push((ssrc, codec));
        }
    }

    pub fn codec_for_ssrc(&self, ssrc: u32) -> Codec {
        self.ssrc_codec_pairs
            .lock()
            .expect("ssrc codec mutex poisoned")
            .iter()
            .find(|(s, _)| *s == ssrc)
            .map(|(_, codec)| *codec)
            .unwrap_or(Codec::Opus)
    }

    pub fn stats(&self, media_type: MediaType) -> EncryptionStats {
        self.stats.lock().expect("stats mutex poisoned")[media_type as usize]
    }

    /// Encrypts one media frame, returning the full wire frame including the
    /// supplemental trailer.
    pub fn encrypt(
        &self,
        media_type: MediaType,
        ssrc: u32,
        frame: &[u8],
    ) -> Result<Vec<u8>, DaveError> {
        let stats_index = media_type as usize;

        if self.is_passthrough_mode() {
            // Pass frame through without encrypting
            self.stats.lock().expect("stats mutex poisoned")[stats_index].passthroughs += 1;
            return Ok(frame.to_vec());
        }

        if !self.has_key_ratchet() {
            self.stats.lock().expect("stats mutex poisoned")[stats_index].encrypt_failure += 1;
            return Err(DaveError::NoKeyRatchet);
        }

        let codec = self.codec_for_ssrc(ssrc);

        let mut frame_processor = self.get_or_create_frame_processor();
        frame_processor.process_frame(frame, codec);

        let result = self.encrypt_with_processor(&mut frame_processor, stats_index);

        self.return_frame_processor(frame_processor);
        result
    }

    fn encrypt_with_processor(
        &self,
        frame_processor: &mut OutboundFrameProcessor,
        stats_index: usize,
    ) -> Result<Vec<u8>, DaveError> {
        let unencrypted_ranges = frame_processor.unencrypted_ranges().clone();
        let ranges_size = unencrypted_ranges_size(&unencrypted_ranges) as usize;

        // some codecs (e.g. H26X) have packetizers that cannot handle
        // specific byte sequences, so we attempt up to
        // MAX_CIPHERTEXT_VALIDATION_RETRIES encryptions, re-rolling the
        // truncated nonce until the ciphertext passes codec validation
        for attempt in 1..=MAX_CIPHERTEXT_VALIDATION_RETRIES {
            let Some((cryptor, truncated_nonce)) = self.next_cryptor_and_nonce() else {
                self.stats.lock().expect("stats mutex poisoned")[stats_index].encrypt_failure += 1;
                return Err(DaveError::EncryptionFailure);
            };

            // write the truncated nonce into a full sized nonce buffer
            // (the encryption call expects a full size nonce)
            let mut nonce_buffer = [0u8; AES_GCM_128_NONCE_BYTES];
            LittleEndian::write_u32(
                &mut nonce_buffer[super::AES_GCM_128_TRUNCATED_SYNC_NONCE_OFFSET..],
                truncated_nonce,
            );

            // encrypt the plaintext, adding the unencrypted bytes to the tag
            let mut tag = [0u8; AES_GCM_127_TRUNCATED_TAG_BYTES];
            let success = {
                let unencrypted = frame_processor.unencrypted_bytes().to_vec();
                let plaintext = frame_processor.encrypted_bytes().to_vec();
                cryptor.encrypt(
                    frame_processor.ciphertext_bytes_mut(),
                    &plaintext,
                    &nonce_buffer,
                    &unencrypted,
                    &mut tag,
                )
            };

            {
                let mut stats = self.stats.lock().expect("stats mutex poisoned");
                stats[stats_index].encrypt_attempts += 1;
                stats[stats_index].encrypt_max_attempts =
                    u64::max(stats[stats_index].encrypt_max_attempts, u64::from(attempt));
            }

            if !success {
                self.stats.lock().expect("stats mutex poisoned")[stats_index].encrypt_failure += 1;
                return Err(DaveError::EncryptionFailure);
            }

            // reassemble the wire frame and append the supplemental trailer
            let nonce_size = leb128_size(u64::from(truncated_nonce));
            let supplemental_size = SUPPLEMENTAL_BYTES + nonce_size + ranges_size;
            let frame_size = frame_processor.reconstructed_size();

            let mut encrypted_frame = vec![0u8; frame_size];
            let reconstructed = frame_processor.reconstruct_frame(&mut encrypted_frame);
            if reconstructed != frame_size {
                self.stats.lock().expect("stats mutex poisoned")[stats_index].encrypt_failure += 1;
                return Err(DaveError::EncryptionFailure);
            }

            encrypted_frame.extend_from_slice(&tag);
            write_leb128(u64::from(truncated_nonce), &mut encrypted_frame);
            serialize_unencrypted_ranges(&unencrypted_ranges, &mut encrypted_frame);
            encrypted_frame.push(supplemental_size as u8);
            encrypted_frame.extend_from_slice(&MARKER_BYTES);

            if codec_utils::validate_encrypted_frame(frame_processor, &encrypted_frame) {
                self.stats.lock().expect("stats mutex poisoned")[stats_index].encrypt_success += 1;
                return Ok(encrypted_frame);
            }

            trace!("DAVE: Roll nonce after failed ciphertext validation, attempt {attempt}");
        }

        warn!(
            "DAVE: Giving up encrypting frame after {MAX_CIPHERTEXT_VALIDATION_RETRIES} ciphertext validation attempts"
        );
        self.stats.lock().expect("stats mutex poisoned")[stats_index].encrypt_failure += 1;
        Err(DaveError::CodecValidationFailed)
    }

    /// Advances the packet nonce and returns the cipher for its generation,
    /// creating a new cipher when the generation rolls over.
    fn next_cryptor_and_nonce(&self) -> Option<(Arc<Aes128GcmCipher>, u32)> {
        let mut state = self.key_state.lock().expect("key state mutex poisoned");

        state.truncated_nonce = state.truncated_nonce.wrapping_add(1);
        let truncated_nonce = state.truncated_nonce;

        let generation = compute_wrapped_generation(
            state.current_key_generation,
            truncated_nonce >> RATCHET_GENERATION_SHIFT_BITS,
        );

        if generation != state.current_key_generation || state.cryptor.is_none() {
            state.current_key_generation = generation;
            let generation = state.current_key_generation;

            let key = state.ratchet.as_mut()?.get_key(generation)?;
            state.cryptor = Aes128GcmCipher::new(&key).map(Arc::new);
        }

        state
            .cryptor
            .clone()
            .map(|cryptor| (cryptor, truncated_nonce))
    }

    fn get_or_create_frame_processor(&self) -> OutboundFrameProcessor {
        let mut pool = self
            .frame_processors
            .lock()
            .expect("frame processor mutex poisoned");
        pool.pop().unwrap_or_default()
    }

    fn return_frame_processor(&self, frame_processor: OutboundFrameProcessor) {
        self.frame_processors
            .lock()
            .expect("frame processor mutex poisoned")
            .push(frame_processor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dave::ratchet::MlsKeyRatchet;
    use zeroize::Zeroizing;

    fn bound_encryptor() -> Encryptor {
        let encryptor = Encryptor::new();
        encryptor.set_key_ratchet(Box::new(MlsKeyRatchet::new(Zeroizing::new(vec![0u8; 16]))));
        encryptor
    }

    #[test]
    fn refuses_to_encrypt_without_ratchet() {
        let encryptor = Encryptor::new();
        let result = encryptor.encrypt(MediaType::Audio, 1234, &[1, 2, 3]);
        assert_eq!(result, Err(DaveError::NoKeyRatchet));
    }

    #[test]
    fn passthrough_copies_the_frame() {
        let encryptor = Encryptor::new();
        encryptor.set_passthrough_mode(true);
        let frame = [1u8, 2, 3, 4];
        let result = encryptor.encrypt(MediaType::Audio, 1234, &frame).unwrap();
        assert_eq!(result, frame);
        assert_eq!(encryptor.stats(MediaType::Audio).passthroughs, 1);
    }

    #[test]
    fn audio_frame_layout() {
        let encryptor = bound_encryptor();
        let opus_packet = crate::dave::OPUS_SILENCE_PACKET;
        let encrypted = encryptor
            .encrypt(MediaType::Audio, 1234, &opus_packet)
            .unwrap();

        // [3 ciphertext][8 tag][1 leb128 nonce = 0x01][0 ranges][1 size][2 magic]
        assert_eq!(encrypted.len(), 3 + 8 + 1 + 1 + 2);
        assert_eq!(&encrypted[encrypted.len() - 2..], &MARKER_BYTES);
        // supplemental size byte: tag + nonce + size + magic = 12
        assert_eq!(encrypted[encrypted.len() - 3], 0x0c);
        // first nonce used is 1
        assert_eq!(encrypted[11], 0x01);
        // fully encrypted, so no leb128 ranges and ciphertext differs
        assert_ne!(&encrypted[..3], &opus_packet);
    }

    #[test]
    fn nonce_advances_every_frame() {
        let encryptor = bound_encryptor();
        let first = encryptor
            .encrypt(MediaType::Audio, 1, &[0xaa, 0xbb])
            .unwrap();
        let second = encryptor
            .encrypt(MediaType::Audio, 1, &[0xaa, 0xbb])
            .unwrap();
        // leb128 nonce sits after ciphertext + tag
        assert_eq!(first[2 + 8], 0x01);
        assert_eq!(second[2 + 8], 0x02);
        assert_ne!(first[..2], second[..2]);
    }

    #[test]
    fn ssrc_codec_assignment() {
        let encryptor = Encryptor::new();
        assert_eq!(encryptor.codec_for_ssrc(77), Codec::Opus);
        encryptor.assign_ssrc_to_codec(77, Codec::H264);
        assert_eq!(encryptor.codec_for_ssrc(77), Codec::H264);
        encryptor.assign_ssrc_to_codec(77, Codec::Av1);
        assert_eq!(encryptor.codec_for_ssrc(77), Codec::Av1);
    }
}
