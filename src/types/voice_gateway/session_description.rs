// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::types::WebSocketEvent;
use serde::{Deserialize, Serialize};

use super::VoiceEncryptionMode;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
/// Event that describes our encryption mode and secret key for encryption
///
/// See <https://discord.com/developers/docs/topics/voice-connections#transport-encryption-and-sending-voice>
pub struct SessionDescription {
    /// The encryption mode to use
    #[serde(rename = "mode")]
    pub encryption_mode: VoiceEncryptionMode,
    /// The secret key we'll use for transport encryption
    pub secret_key: [u8; 32],
    /// The DAVE protocol version the server selected for this session.
    ///
    /// 0 (or absent) means no end-to-end encryption.
    #[serde(default)]
    pub dave_protocol_version: u8,
    #[serde(default)]
    pub media_session_id: Option<String>,
}

impl WebSocketEvent for SessionDescription {}
