// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::types::{VoiceCloseCode, VoiceGatewayReceivePayload};

/// Represents a text message received from the voice websocket connection,
/// containing a voice gateway event.
///
/// This struct is used internally when handling messages.
#[derive(Clone, Debug)]
pub struct VoiceGatewayMessage(pub String);

impl VoiceGatewayMessage {
    /// Parses the message as a payload;
    /// Returns a result of deserializing
    pub fn payload(&self) -> Result<VoiceGatewayReceivePayload, serde_json::Error> {
        serde_json::from_str(&self.0)
    }
}

/// Represents a binary message received from the voice websocket connection;
/// these carry the MLS messages of the DAVE protocol.
#[derive(Clone, Debug)]
pub struct VoiceGatewayBinaryMessage(pub Vec<u8>);

/// Anything the voice websocket can hand us: a text frame, a binary (DAVE)
/// frame, or a close code.
#[derive(Clone, Debug)]
pub enum VoiceGatewayCommunication {
    Message(VoiceGatewayMessage),
    Binary(VoiceGatewayBinaryMessage),
    Error(VoiceCloseCode),
}
