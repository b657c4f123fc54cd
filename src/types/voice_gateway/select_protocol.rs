// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};

use super::VoiceEncryptionMode;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
/// An event sent by the client to the voice gateway server,
/// detailing what protocol, address and encryption to use;
///
/// See <https://discord.com/developers/docs/topics/voice-connections#establishing-a-voice-udp-connection-example-select-protocol-payload>
pub struct SelectProtocol {
    /// The protocol to use. The only option descant supports is [VoiceProtocol::Udp].
    pub protocol: VoiceProtocol,
    pub data: SelectProtocolData,
}

/// The possible protocols for sending and receiving voice data.
#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VoiceProtocol {
    #[default]
    /// Sending data via UDP, documented and the only protocol descant supports.
    Udp,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone)]
/// The data field of the SelectProtocol Event
pub struct SelectProtocolData {
    /// Our external IP we got from IP discovery
    pub address: String,
    /// Our external UDP port we got from IP discovery
    pub port: u16,
    /// The mode of encryption to use
    pub mode: VoiceEncryptionMode,
}
