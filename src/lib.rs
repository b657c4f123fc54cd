// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Descant is a library for real-time voice on Spacebar-compatible instances.
//!
//! It implements the voice gateway control plane (identify/resume, heartbeats,
//! speaking announcements), the UDP media plane (RTP with
//! `aead_xchacha20_poly1305_rtpsize` transport encryption, paced sending,
//! per-speaker receive and decode) and the DAVE end-to-end encryption layer
//! (an MLS group session driving per-user AES-128-GCM frame key ratchets).
//!
//! The entry point is [voice::VoiceHandler], which is constructed from the
//! connection info the main gateway hands out on a voice server update.

#![allow(clippy::module_inception)]

pub mod dave;
pub mod errors;
pub mod types;
pub mod voice;

// Pub use this so users can interact with packet types if they want
pub use discortp;
