// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::types::{Snowflake, WebSocketEvent};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
/// The identify payload for the voice gateway connection;
///
/// Contains authentication info and context to authenticate to the voice gateway.
///
/// See <https://discord.com/developers/docs/topics/voice-connections#establishing-a-voice-websocket-connection>
pub struct VoiceIdentify {
    /// The ID of the guild or the private channel being connected to
    pub server_id: Snowflake,
    pub user_id: Snowflake,
    pub session_id: String,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<bool>,
    /// The highest DAVE protocol version we can speak; 0 opts out of
    /// end-to-end encryption.
    pub max_dave_protocol_version: u8,
}

impl WebSocketEvent for VoiceIdentify {}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
/// Resumes an existing voice gateway session after a dropped connection.
///
/// See <https://discord.com/developers/docs/topics/voice-connections#resuming-voice-connection>
pub struct VoiceResume {
    pub server_id: Snowflake,
    pub session_id: String,
    pub token: String,
    /// The sequence number of the last payload we saw on this session.
    pub seq_ack: i32,
}

impl WebSocketEvent for VoiceResume {}
