// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Module for all voice functionality within descant.

mod crypto;
pub mod courier;
pub mod events;
pub mod gateway;
pub mod handler;
pub mod opus;
pub mod udp;
pub mod voice_data;

pub use handler::{VoiceHandler, VoiceSessionOptions};
