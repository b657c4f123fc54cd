// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};

use crate::types::{Snowflake, WebSocketEvent};

/// Event that tells the server we are speaking;
///
/// Essentially, what allows us to send UDP data and lights up the green circle around your avatar.
///
/// See <https://discord.com/developers/docs/topics/voice-connections#speaking>
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Speaking {
    /// Data about the audio we're transmitting.
    ///
    /// 1 = microphone, 2 = soundshare, 4 = priority speaker.
    pub speaking: u8,
    pub ssrc: u32,
    /// The user id of the speaking user, only sent by the server
    #[serde(skip_serializing)]
    pub user_id: Option<Snowflake>,
    /// Delay in milliseconds, not sent by the server
    #[serde(default)]
    pub delay: u64,
}

impl WebSocketEvent for Speaking {}
