// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Cache of frame ciphers keyed by ratchet generation, plus the nonce
//! bookkeeping that guards against replay and nonce exhaustion.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::*;

use super::cipher::Aes128GcmCipher;
use super::ratchet::{KeyGeneration, KeyRatchet};
use super::{
    CIPHER_EXPIRY, GENERATION_WRAP, MAX_FRAMES_PER_SECOND, MAX_GENERATION_GAP,
    MAX_MISSING_NONCES, RATCHET_GENERATION_SHIFT_BITS,
};

/// A nonce widened with its wrapped generation so ordering survives the
/// 8-bit generation counter rolling over.
pub type BigNonce = u64;

/// Computes the full generation a truncated (8 bit) generation refers to,
/// assuming it is at or after `oldest`. A wrong guess for heavily delayed
/// frames is caught by the max generation gap check.
pub fn compute_wrapped_generation(oldest: KeyGeneration, generation: KeyGeneration) -> KeyGeneration {
    let remainder = oldest % GENERATION_WRAP;
    let factor = oldest / GENERATION_WRAP + u32::from(generation < remainder);
    factor * GENERATION_WRAP + generation
}

/// Replaces the generation bits of `nonce` with the full wrapped generation.
pub fn compute_wrapped_big_nonce(generation: KeyGeneration, nonce: u32) -> BigNonce {
    let masked_nonce = u64::from(nonce) & ((1 << RATCHET_GENERATION_SHIFT_BITS) - 1);
    (u64::from(generation) << RATCHET_GENERATION_SHIFT_BITS) | masked_nonce
}

struct ExpiringCipher {
    cipher: Option<Arc<Aes128GcmCipher>>,
    /// [None] means the cipher never expires (the newest generation).
    expiry: Option<Instant>,
}

/// Manages the ciphers for one key ratchet across its generations.
pub struct AeadCipherManager {
    ratchet: Box<dyn KeyRatchet>,
    cryptor_generations: HashMap<KeyGeneration, ExpiringCipher>,

    ratchet_creation: Instant,
    ratchet_expiry: Option<Instant>,
    oldest_generation: KeyGeneration,
    newest_generation: KeyGeneration,

    newest_processed_nonce: Option<BigNonce>,
    missing_nonces: VecDeque<BigNonce>,

    /// Amount the manager's view of "now" is ahead of the wall clock.
    /// Stays zero outside of tests.
    clock_advance: Duration,
}

impl AeadCipherManager {
    pub fn new(ratchet: Box<dyn KeyRatchet>) -> AeadCipherManager {
        AeadCipherManager {
            ratchet,
            cryptor_generations: HashMap::new(),
            ratchet_creation: Instant::now(),
            ratchet_expiry: None,
            oldest_generation: 0,
            newest_generation: 0,
            newest_processed_nonce: None,
            missing_nonces: VecDeque::new(),
            clock_advance: Duration::ZERO,
        }
    }

    fn now(&self) -> Instant {
        Instant::now() + self.clock_advance
    }

    #[cfg(test)]
    pub(super) fn advance_clock(&mut self, by: Duration) {
        self.clock_advance += by;
    }

    /// Caps the lifetime of this whole ratchet, e.g. when a newer ratchet
    /// took over after an execute transition.
    pub fn update_expiry(&mut self, expiry: Instant) {
        self.ratchet_expiry = Some(expiry);
    }

    pub fn is_expired(&self) -> bool {
        match self.ratchet_expiry {
            Some(expiry) => self.now() > expiry,
            None => false,
        }
    }

    /// Whether a frame with this generation and nonce can still be accepted:
    /// it must be newer than the newest accepted nonce or sit in the window
    /// of nonces we know we missed.
    pub fn can_process_nonce(&self, generation: KeyGeneration, nonce: u32) -> bool {
        let Some(newest) = self.newest_processed_nonce else {
            return true;
        };

        let wrapped_big_nonce = compute_wrapped_big_nonce(generation, nonce);
        wrapped_big_nonce > newest || self.missing_nonces.contains(&wrapped_big_nonce)
    }

    pub fn compute_wrapped_generation(&self, generation: KeyGeneration) -> KeyGeneration {
        compute_wrapped_generation(self.oldest_generation, generation)
    }

    /// Returns the cipher for `generation`, creating it on demand from the
    /// key ratchet.
    pub fn get_cipher(&mut self, generation: KeyGeneration) -> Option<Arc<Aes128GcmCipher>> {
        self.cleanup_expired_ciphers();

        if generation < self.oldest_generation {
            trace!(
                "DAVE: Received frame with old generation: {generation}, oldest generation: {}",
                self.oldest_generation
            );
            return None;
        }

        if generation > self.newest_generation + MAX_GENERATION_GAP {
            trace!(
                "DAVE: Received frame with future generation: {generation}, newest generation: {}",
                self.newest_generation
            );
            return None;
        }

        // Generations this far out would mean the sender wrapped nonces
        // faster than any legitimate frame rate allows
        let ratchet_lifetime_sec = (self.now() - self.ratchet_creation).as_secs();
        let max_lifetime_frames = MAX_FRAMES_PER_SECOND * ratchet_lifetime_sec;
        let max_lifetime_generations =
            (max_lifetime_frames >> RATCHET_GENERATION_SHIFT_BITS) as u32;
        if generation > max_lifetime_generations {
            debug!(
                "DAVE: Received frame with generation {generation} beyond ratchet max lifetime generations: {max_lifetime_generations}, ratchet lifetime: {ratchet_lifetime_sec}s"
            );
            return None;
        }

        if !self.cryptor_generations.contains_key(&generation) {
            // We don't have a cryptor for this generation, create one
            let cipher = self.make_expiring_cipher(generation);
            self.cryptor_generations.insert(generation, cipher);
        }

        self.cryptor_generations
            .get(&generation)
            .and_then(|entry| entry.cipher.clone())
    }

    /// Records a successful decrypt under `(generation, nonce)`: updates the
    /// newest generation, clamps the expiry of older generations, and
    /// maintains the missing-nonce window.
    pub fn report_cipher_success(&mut self, generation: KeyGeneration, nonce: u32) {
        let wrapped_big_nonce = compute_wrapped_big_nonce(generation, nonce);

        // Add any missing nonces to the queue
        match self.newest_processed_nonce {
            None => {
                self.newest_processed_nonce = Some(wrapped_big_nonce);
            }
            Some(newest) if wrapped_big_nonce > newest => {
                let oldest_missing_nonce = wrapped_big_nonce.saturating_sub(MAX_MISSING_NONCES);

                while let Some(&front) = self.missing_nonces.front() {
                    if front >= oldest_missing_nonce {
                        break;
                    }
                    self.missing_nonces.pop_front();
                }

                // If we're missing a lot, we don't want to add everything
                // since the newest processed nonce
                let missing_range_start = u64::max(oldest_missing_nonce, newest + 1);
                for missing in missing_range_start..wrapped_big_nonce {
                    self.missing_nonces.push_back(missing);
                }

                self.newest_processed_nonce = Some(wrapped_big_nonce);
            }
            Some(_) => {
                if let Some(position) = self
                    .missing_nonces
                    .iter()
                    .position(|&missing| missing == wrapped_big_nonce)
                {
                    self.missing_nonces.remove(position);
                }
            }
        }

        if generation <= self.newest_generation
            || !self.cryptor_generations.contains_key(&generation)
        {
            return;
        }
        trace!("DAVE: Reporting cryptor success, generation: {generation}");
        self.newest_generation = generation;

        // Update the expiry time for all old cryptors
        let expiry_time = self.now() + CIPHER_EXPIRY;
        for (gen, entry) in self.cryptor_generations.iter_mut() {
            if *gen < self.newest_generation {
                trace!("DAVE: Updating expiry for cryptor, generation: {gen}");
                entry.expiry = Some(match entry.expiry {
                    Some(expiry) => Instant::min(expiry, expiry_time),
                    None => expiry_time,
                });
            }
        }
    }

    fn make_expiring_cipher(&mut self, generation: KeyGeneration) -> ExpiringCipher {
        // Get the new key from the ratchet
        let key = self.ratchet.get_key(generation);

        // If we got frames out of order, we might have to create a cryptor
        // for an old generation. In that case, create it with a finite expiry
        // time as we have already transitioned to a newer generation
        let expiry = if generation < self.newest_generation {
            debug!("DAVE: Creating cryptor for old generation: {generation}");
            Some(self.now() + CIPHER_EXPIRY)
        } else {
            debug!("DAVE: Creating cryptor for new generation: {generation}");
            None
        };

        ExpiringCipher {
            cipher: key.as_ref().and_then(Aes128GcmCipher::new).map(Arc::new),
            expiry,
        }
    }

    fn cleanup_expired_ciphers(&mut self) {
        let now = self.now();
        self.cryptor_generations.retain(|generation, entry| {
            let expired = matches!(entry.expiry, Some(expiry) if expiry < now);
            if expired {
                trace!("DAVE: Removing expired cryptor, generation: {generation}");
            }
            !expired
        });

        while self.oldest_generation < self.newest_generation
            && !self
                .cryptor_generations
                .contains_key(&self.oldest_generation)
        {
            trace!(
                "DAVE: Deleting key for old generation: {}",
                self.oldest_generation
            );
            self.ratchet.delete_key(self.oldest_generation);
            self.oldest_generation += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dave::ratchet::MlsKeyRatchet;
    use zeroize::Zeroizing;

    fn manager() -> AeadCipherManager {
        let ratchet = MlsKeyRatchet::new(Zeroizing::new(vec![0x55; 16]));
        let mut manager = AeadCipherManager::new(Box::new(ratchet));
        // age the ratchet far enough that the nonce-exhaustion guard
        // doesn't interfere with generation tests
        manager.advance_clock(Duration::from_secs(3600 * 24 * 365 * 20));
        manager
    }

    #[test]
    fn wrapped_generation() {
        assert_eq!(compute_wrapped_generation(0, 5), 5);
        assert_eq!(compute_wrapped_generation(255, 254), 254);
        // oldest passed the wrap point, truncated generation lags behind
        assert_eq!(compute_wrapped_generation(257, 0), 512);
        assert_eq!(compute_wrapped_generation(257, 3), 515);
        assert_eq!(compute_wrapped_generation(257, 200), 456);
    }

    #[test]
    fn wrapped_big_nonce_strips_generation_bits() {
        assert_eq!(compute_wrapped_big_nonce(0, 1), 1);
        assert_eq!(compute_wrapped_big_nonce(1, 0x0100_0001), 0x0100_0001);
        assert_eq!(compute_wrapped_big_nonce(300, 1), (300 << 24) | 1);
    }

    #[test]
    fn generation_gap_boundary() {
        let mut manager = manager();
        assert!(manager.get_cipher(0).is_some());

        // exactly newest + MAX_GENERATION_GAP is accepted
        assert!(manager.get_cipher(MAX_GENERATION_GAP).is_some());
        // one past is rejected
        assert!(manager.get_cipher(MAX_GENERATION_GAP + 1).is_none());
    }

    #[test]
    fn nonce_replay_rejected() {
        let mut manager = manager();
        assert!(manager.can_process_nonce(0, 5));
        manager.get_cipher(0);
        manager.report_cipher_success(0, 5);

        // the exact same nonce is now a replay
        assert!(!manager.can_process_nonce(0, 5));
        // newer is fine
        assert!(manager.can_process_nonce(0, 6));
    }

    #[test]
    fn missing_nonce_window() {
        let mut manager = manager();
        manager.get_cipher(0);
        manager.report_cipher_success(0, 1);

        // jump forward exactly MAX_MISSING_NONCES; the gap is recoverable
        let jump = 1 + MAX_MISSING_NONCES as u32;
        manager.report_cipher_success(0, jump);
        assert!(manager.can_process_nonce(0, 2));
        assert!(manager.can_process_nonce(0, jump - 1));

        // a gap one wider drops the oldest missing nonce
        let mut manager = manager();
        manager.get_cipher(0);
        manager.report_cipher_success(0, 1);
        manager.report_cipher_success(0, 3 + MAX_MISSING_NONCES as u32);
        assert!(!manager.can_process_nonce(0, 2));
        assert!(manager.can_process_nonce(0, 3));
    }

    #[test]
    fn out_of_order_nonce_accepted_once() {
        let mut manager = manager();
        manager.get_cipher(0);
        manager.report_cipher_success(0, 10);

        // 3 was skipped and is in the missing set
        assert!(manager.can_process_nonce(0, 3));
        manager.report_cipher_success(0, 3);
        assert!(!manager.can_process_nonce(0, 3));
    }
}
