// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The DAVE end-to-end encryption layer.
//!
//! DAVE wraps media frames in an extra AEAD layer keyed through an MLS group
//! session, so that the voice server forwards packets it cannot read. The
//! frame format is codec aware: byte ranges a WebRTC packetizer must read
//! stay unencrypted and are authenticated as associated data instead.
//!
//! See <https://daveprotocol.com/> for the protocol whitepaper.

pub mod cipher;
pub mod codec_utils;
pub mod cryptor_manager;
pub mod decryptor;
pub mod displayable_code;
pub mod encryptor;
pub mod frame_processors;
pub mod leb128;
pub mod persisted_key_pair;
pub mod ranges;
pub mod ratchet;
pub mod session;

use std::time::Duration;

/// The highest DAVE protocol version this library speaks.
pub const MAX_PROTOCOL_VERSION: u8 = 1;

/// Protocol version value meaning end-to-end encryption is off.
pub const DISABLED_PROTOCOL_VERSION: u8 = 0;

/// Magic marker terminating every DAVE-encrypted frame.
pub const MARKER_BYTES: [u8; 2] = [0xfa, 0xfa];

// Layout constants
pub const AES_GCM_128_KEY_BYTES: usize = 16;
pub const AES_GCM_128_NONCE_BYTES: usize = 12;
pub const AES_GCM_128_TRUNCATED_SYNC_NONCE_BYTES: usize = 4;
pub const AES_GCM_128_TRUNCATED_SYNC_NONCE_OFFSET: usize =
    AES_GCM_128_NONCE_BYTES - AES_GCM_128_TRUNCATED_SYNC_NONCE_BYTES;
pub const AES_GCM_127_TRUNCATED_TAG_BYTES: usize = 8;
pub const RATCHET_GENERATION_BYTES: usize = 1;
pub const RATCHET_GENERATION_SHIFT_BITS: usize =
    8 * (AES_GCM_128_TRUNCATED_SYNC_NONCE_BYTES - RATCHET_GENERATION_BYTES);
/// Truncated tag + supplemental size byte + magic marker.
pub const SUPPLEMENTAL_BYTES: usize = AES_GCM_127_TRUNCATED_TAG_BYTES + 1 + MARKER_BYTES.len();

// Timing constants
pub const DEFAULT_TRANSITION_EXPIRY: Duration = Duration::from_secs(10);
pub const CIPHER_EXPIRY: Duration = Duration::from_secs(10);
/// How long old per-user ratchets stay usable after an execute transition.
pub const RATCHET_EXPIRY: Duration = Duration::from_secs(10);

// Behavior constants
pub const INIT_TRANSITION_ID: u16 = 0;
pub const MAX_GENERATION_GAP: u32 = 250;
pub const MAX_MISSING_NONCES: u64 = 1000;
pub const GENERATION_WRAP: u32 = 1 << (8 * RATCHET_GENERATION_BYTES);
/// 50 audio frames + 2 * 60fps video streams
pub const MAX_FRAMES_PER_SECOND: u64 = 50 + 2 * 60;

/// The canonical Opus silence frame.
pub const OPUS_SILENCE_PACKET: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Whether a frame carries audio or video; decides codec defaults and stats
/// bucketing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
}

/// The codec of a media frame, deciding which byte ranges stay unencrypted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    #[default]
    Unknown,
    Opus,
    Vp8,
    Vp9,
    H264,
    H265,
    Av1,
}
