// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Decrypts received media frames with one or more key ratchets.
//!
//! Around an execute transition both the previous and the fresh ratchet can
//! be live, so the decryptor keeps a short queue of cipher managers and tries
//! the newest first.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::*;

use super::cryptor_manager::AeadCipherManager;
use super::frame_processors::InboundFrameProcessor;
use super::ratchet::KeyRatchet;
use super::{
    MediaType, AES_GCM_128_NONCE_BYTES, AES_GCM_128_TRUNCATED_SYNC_NONCE_OFFSET,
    OPUS_SILENCE_PACKET, RATCHET_GENERATION_SHIFT_BITS,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct DecryptionStats {
    pub passthroughs: u64,
    pub decrypt_success: u64,
    pub decrypt_failure: u64,
    pub decrypt_attempts: u64,
}

/// Until when unencrypted frames may be passed through unchanged.
enum Passthrough {
    Forever,
    Until(Instant),
}

/// The inbound half of DAVE frame decryption; one per remote user.
pub struct Decryptor {
    cryptor_managers: VecDeque<AeadCipherManager>,
    frame_processors: Vec<InboundFrameProcessor>,
    allow_passthrough_until: Passthrough,
    stats: [DecryptionStats; 2],
}

impl Default for Decryptor {
    fn default() -> Self {
        Decryptor::new()
    }
}

impl Decryptor {
    pub fn new() -> Decryptor {
        Decryptor {
            cryptor_managers: VecDeque::new(),
            frame_processors: Vec::new(),
            // passthrough is disabled until a transition enables it
            allow_passthrough_until: Passthrough::Until(Instant::now()),
            stats: [DecryptionStats::default(); 2],
        }
    }

    /// Installs a new key ratchet for this user. Existing ratchets stay
    /// usable for `transition_expiry` so frames still in flight from the old
    /// epoch decrypt.
    pub fn transition_to_key_ratchet(
        &mut self,
        ratchet: Box<dyn KeyRatchet>,
        transition_expiry: Duration,
    ) {
        trace!(
            "DAVE: Transitioning to new key ratchet, expiry: {}s",
            transition_expiry.as_secs()
        );
        self.update_cryptor_manager_expiry(transition_expiry);
        self.cryptor_managers
            .push_back(AeadCipherManager::new(ratchet));
    }

    /// Turns passthrough on (for a downgrade to protocol version 0) or
    /// starts winding it down.
    pub fn transition_to_passthrough_mode(
        &mut self,
        passthrough_mode: bool,
        transition_expiry: Duration,
    ) {
        if passthrough_mode {
            self.allow_passthrough_until = Passthrough::Forever;
        } else {
            let max_expiry = Instant::now() + transition_expiry;
            self.allow_passthrough_until = match self.allow_passthrough_until {
                Passthrough::Forever => Passthrough::Until(max_expiry),
                Passthrough::Until(current) => {
                    Passthrough::Until(Instant::min(current, max_expiry))
                }
            };
        }
    }

    pub fn stats(&self, media_type: MediaType) -> DecryptionStats {
        self.stats[media_type as usize]
    }

    /// Decrypts one received frame, returning the plaintext media frame.
    ///
    /// Unencrypted frames are passed through while passthrough is allowed;
    /// silence packets skip decryption entirely.
    pub fn decrypt(&mut self, media_type: MediaType, encrypted_frame: &[u8]) -> Option<Vec<u8>> {
        let stats_index = media_type as usize;

        // Skip decrypting silence frames
        if media_type == MediaType::Audio && encrypted_frame == OPUS_SILENCE_PACKET {
            trace!("DAVE: decrypt skipping silence of size: {}", encrypted_frame.len());
            return Some(encrypted_frame.to_vec());
        }

        // Remove any expired cryptor managers
        self.cleanup_expired_cryptor_managers();

        let can_use_passthrough = match self.allow_passthrough_until {
            Passthrough::Forever => true,
            Passthrough::Until(until) => Instant::now() < until,
        };

        // Process the incoming frame; this checks whether it looks like a
        // valid encrypted frame and splits it into its components
        let mut frame_processor = self.get_or_create_frame_processor();
        frame_processor.parse_frame(encrypted_frame);

        if !frame_processor.is_encrypted() {
            self.return_frame_processor(frame_processor);
            if can_use_passthrough {
                self.stats[stats_index].passthroughs += 1;
                return Some(encrypted_frame.to_vec());
            }
            warn!("DAVE: decrypt failed, frame is not encrypted and pass through is disabled");
            self.stats[stats_index].decrypt_failure += 1;
            return None;
        }

        // Try the newest cryptor managers first
        let mut success = false;
        for manager_index in (0..self.cryptor_managers.len()).rev() {
            if Self::decrypt_impl(
                &mut self.cryptor_managers[manager_index],
                &mut self.stats[stats_index],
                &mut frame_processor,
            ) {
                success = true;
                break;
            }
        }

        let result = if success {
            self.stats[stats_index].decrypt_success += 1;
            let mut frame = vec![0u8; frame_processor.plaintext_size()];
            let written = frame_processor.reconstruct_frame(&mut frame);
            frame.truncate(written);
            Some(frame)
        } else {
            self.stats[stats_index].decrypt_failure += 1;
            warn!(
                "DAVE: decrypt failed, no valid cryptor found, type: {}, encrypted frame size: {}, number of cryptor managers: {}, passthrough enabled: {}",
                if media_type == MediaType::Video { "video" } else { "audio" },
                encrypted_frame.len(),
                self.cryptor_managers.len(),
                if can_use_passthrough { "yes" } else { "no" },
            );
            None
        };

        self.return_frame_processor(frame_processor);
        result
    }

    fn decrypt_impl(
        cipher_manager: &mut AeadCipherManager,
        stats: &mut DecryptionStats,
        frame: &mut InboundFrameProcessor,
    ) -> bool {
        let truncated_nonce = frame.truncated_nonce();

        // expand the truncated nonce to the full sized one needed for decryption
        let mut nonce_buffer = [0u8; AES_GCM_128_NONCE_BYTES];
        LittleEndian::write_u32(
            &mut nonce_buffer[AES_GCM_128_TRUNCATED_SYNC_NONCE_OFFSET..],
            truncated_nonce,
        );

        let generation = cipher_manager
            .compute_wrapped_generation(truncated_nonce >> RATCHET_GENERATION_SHIFT_BITS);

        if !cipher_manager.can_process_nonce(generation, truncated_nonce) {
            trace!("DAVE: decrypt failed, cannot process nonce");
            return false;
        }

        let Some(cipher) = cipher_manager.get_cipher(generation) else {
            warn!("DAVE: decrypt failed, no cryptor found for generation: {generation}");
            return false;
        };

        stats.decrypt_attempts += 1;

        let tag = frame.tag().to_vec();
        let ciphertext = frame.ciphertext().to_vec();
        let authenticated = frame.authenticated_data().to_vec();
        let success = cipher.decrypt(
            frame.plaintext_mut(),
            &ciphertext,
            &tag,
            &nonce_buffer,
            &authenticated,
        );

        if success {
            cipher_manager.report_cipher_success(generation, truncated_nonce);
        }

        success
    }

    fn update_cryptor_manager_expiry(&mut self, expiry: Duration) {
        let max_expiry_time = Instant::now() + expiry;
        for manager in self.cryptor_managers.iter_mut() {
            manager.update_expiry(max_expiry_time);
        }
    }

    fn cleanup_expired_cryptor_managers(&mut self) {
        while let Some(front) = self.cryptor_managers.front() {
            if !front.is_expired() {
                break;
            }
            trace!("DAVE: Removing expired cryptor manager");
            self.cryptor_managers.pop_front();
        }
    }

    fn get_or_create_frame_processor(&mut self) -> InboundFrameProcessor {
        self.frame_processors
            .pop()
            .unwrap_or_else(InboundFrameProcessor::new)
    }

    fn return_frame_processor(&mut self, frame_processor: InboundFrameProcessor) {
        self.frame_processors.push(frame_processor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dave::encryptor::Encryptor;
    use crate::dave::ratchet::MlsKeyRatchet;
    use crate::dave::RATCHET_EXPIRY;
    use zeroize::Zeroizing;

    fn ratchet() -> Box<MlsKeyRatchet> {
        Box::new(MlsKeyRatchet::new(Zeroizing::new(vec![0u8; 16])))
    }

    fn pair() -> (Encryptor, Decryptor) {
        let encryptor = Encryptor::new();
        encryptor.set_key_ratchet(ratchet());

        let mut decryptor = Decryptor::new();
        decryptor.transition_to_key_ratchet(ratchet(), RATCHET_EXPIRY);
        (encryptor, decryptor)
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (encryptor, mut decryptor) = pair();

        let opus_frame = [0x4f, 0x50, 0x55, 0x53, 0x21];
        let encrypted = encryptor
            .encrypt(MediaType::Audio, 1234, &opus_frame)
            .unwrap();
        let decrypted = decryptor.decrypt(MediaType::Audio, &encrypted).unwrap();
        assert_eq!(decrypted, opus_frame);
    }

    #[test]
    fn replayed_frame_is_rejected() {
        let (encryptor, mut decryptor) = pair();

        let encrypted = encryptor.encrypt(MediaType::Audio, 1, &[1, 2, 3]).unwrap();
        assert!(decryptor.decrypt(MediaType::Audio, &encrypted).is_some());
        assert!(decryptor.decrypt(MediaType::Audio, &encrypted).is_none());
    }

    #[test]
    fn silence_passes_untouched() {
        let (_, mut decryptor) = pair();
        let silence = OPUS_SILENCE_PACKET;
        assert_eq!(
            decryptor.decrypt(MediaType::Audio, &silence).unwrap(),
            silence
        );
    }

    #[test]
    fn unencrypted_frame_requires_passthrough() {
        let (_, mut decryptor) = pair();
        let not_dave = [1u8, 2, 3, 4, 5];
        assert!(decryptor.decrypt(MediaType::Audio, &not_dave).is_none());

        decryptor.transition_to_passthrough_mode(true, RATCHET_EXPIRY);
        assert_eq!(
            decryptor.decrypt(MediaType::Audio, &not_dave).unwrap(),
            not_dave
        );
    }

    #[test]
    fn second_ratchet_decrypts_new_epoch() {
        let (encryptor, mut decryptor) = pair();

        let before = encryptor.encrypt(MediaType::Audio, 1, &[9, 9, 9]).unwrap();
        assert!(decryptor.decrypt(MediaType::Audio, &before).is_some());

        // new epoch: both sides swap ratchets
        let new_secret = Zeroizing::new(vec![7u8; 16]);
        encryptor.set_key_ratchet(Box::new(MlsKeyRatchet::new(new_secret.clone())));
        decryptor
            .transition_to_key_ratchet(Box::new(MlsKeyRatchet::new(new_secret)), RATCHET_EXPIRY);

        let after = encryptor.encrypt(MediaType::Audio, 1, &[8, 8, 8]).unwrap();
        assert_eq!(decryptor.decrypt(MediaType::Audio, &after).unwrap(), [8, 8, 8]);
    }

    #[test]
    fn video_frames_use_codec_ranges() {
        let (encryptor, mut decryptor) = pair();
        encryptor.assign_ssrc_to_codec(99, crate::dave::Codec::Vp8);

        // key frame: first 10 bytes unencrypted
        let frame: Vec<u8> = (0u8..32).map(|b| b & 0xfe).collect();
        let encrypted = encryptor.encrypt(MediaType::Video, 99, &frame).unwrap();

        // the unencrypted header is visible in the wire frame
        assert_eq!(&encrypted[..10], &frame[..10]);

        let decrypted = decryptor.decrypt(MediaType::Video, &encrypted).unwrap();
        assert_eq!(decrypted, frame);
    }
}
