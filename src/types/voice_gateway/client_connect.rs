// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::types::{Snowflake, WebSocketEvent};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
/// Sent when one or more users connect to the voice channel.
///
/// For DAVE sessions these users become part of the recognized set the MLS
/// group may include.
///
/// {"op":11,"d":{"user_ids":["1234567890"]}}
pub struct VoiceClientConnect {
    pub user_ids: Vec<Snowflake>,
}

impl WebSocketEvent for VoiceClientConnect {}
