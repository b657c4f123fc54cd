// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use super::WebSocketEvent;
use serde::{Deserialize, Serialize};
use serde_json::{value::RawValue, Value};

pub use client_connect::*;
pub use client_disconnect::*;
pub use dave::*;
pub use hello::*;
pub use identify::*;
pub use ready::*;
pub use select_protocol::*;
pub use session_description::*;
pub use speaking::*;

mod client_connect;
mod client_disconnect;
mod dave;
mod hello;
mod identify;
mod ready;
mod select_protocol;
mod session_description;
mod speaking;

// Opcodes of the voice gateway, protocol version 8.
//
// See <https://discord.com/developers/docs/topics/opcodes-and-status-codes#voice>
pub const VOICE_IDENTIFY: u8 = 0;
pub const VOICE_SELECT_PROTOCOL: u8 = 1;
pub const VOICE_READY: u8 = 2;
pub const VOICE_HEARTBEAT: u8 = 3;
pub const VOICE_SESSION_DESCRIPTION: u8 = 4;
pub const VOICE_SPEAKING: u8 = 5;
pub const VOICE_HEARTBEAT_ACK: u8 = 6;
pub const VOICE_RESUME: u8 = 7;
pub const VOICE_HELLO: u8 = 8;
pub const VOICE_RESUMED: u8 = 9;
pub const VOICE_MULTIPLE_CLIENTS_CONNECT: u8 = 11;
pub const VOICE_CLIENT_DISCONNECT: u8 = 13;

// The DAVE protocol opcodes. 21..24 travel as JSON text frames, 25..31 as
// binary frames (see [DaveBinaryMessage]).
pub const VOICE_DAVE_PREPARE_TRANSITION: u8 = 21;
pub const VOICE_DAVE_EXECUTE_TRANSITION: u8 = 22;
pub const VOICE_DAVE_TRANSITION_READY: u8 = 23;
pub const VOICE_DAVE_PREPARE_EPOCH: u8 = 24;
pub const VOICE_DAVE_MLS_EXTERNAL_SENDER: u8 = 25;
pub const VOICE_DAVE_MLS_KEY_PACKAGE: u8 = 26;
pub const VOICE_DAVE_MLS_PROPOSALS: u8 = 27;
pub const VOICE_DAVE_MLS_COMMIT_MESSAGE: u8 = 28;
pub const VOICE_DAVE_MLS_ANNOUNCE_COMMIT_TRANSITION: u8 = 29;
pub const VOICE_DAVE_MLS_WELCOME: u8 = 30;
pub const VOICE_DAVE_MLS_INVALID_COMMIT_WELCOME: u8 = 31;

#[derive(Debug, Default, Serialize, Clone)]
/// The payload used for sending events to the voice gateway.
///
/// Similar to [VoiceGatewayReceivePayload], except we send a [Value] for d whilst we receive a [serde_json::value::RawValue]
pub struct VoiceGatewaySendPayload {
    #[serde(rename = "op")]
    pub op_code: u8,

    #[serde(rename = "d")]
    pub data: Value,
}

impl WebSocketEvent for VoiceGatewaySendPayload {}

#[derive(Debug, Deserialize, Clone)]
/// The payload used for receiving events from the voice gateway.
///
/// Note that this is similar to the regular gateway, except we have a `seq`
/// instead of `s` and no `t`.
pub struct VoiceGatewayReceivePayload<'a> {
    #[serde(rename = "op")]
    pub op_code: u8,

    #[serde(borrow)]
    #[serde(rename = "d")]
    pub data: &'a RawValue,

    /// The sequence number of this payload, used for heartbeats and resuming.
    ///
    /// Only some payloads carry one.
    #[serde(default)]
    pub seq: Option<i32>,
}

impl WebSocketEvent for VoiceGatewayReceivePayload<'_> {}

/// The modes of encryption available for the voice UDP connection.
///
/// Descant only sends with [VoiceEncryptionMode::AeadXchacha20Poly1305Rtpsize],
/// the other variants exist so the mode lists the server advertises can be
/// deserialized.
///
/// See <https://discord.com/developers/docs/topics/voice-connections#transport-encryption-modes>
#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VoiceEncryptionMode {
    /// XChaCha20-Poly1305 with the truncated packet nonce appended to the
    /// RTP payload. The only mode this library sends with.
    #[default]
    AeadXchacha20Poly1305Rtpsize,
    /// AES-256-GCM (rtpsize); preferred by Discord where hardware support
    /// exists, not implemented here.
    AeadAes256GcmRtpsize,
    // Deprecated modes, still advertised by some servers
    AeadAes256Gcm,
    Xsalsa20Poly1305,
    Xsalsa20Poly1305Suffix,
    Xsalsa20Poly1305Lite,
    Xsalsa20Poly1305LiteRtpsize,
    /// Catchall so future modes don't break [VoiceReady] parsing.
    #[serde(other)]
    Unknown,
}

/// A voice websocket close code.
///
/// See <https://discord.com/developers/docs/topics/opcodes-and-status-codes#voice-voice-close-event-codes>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum VoiceCloseCode {
    UnknownOpcode = 4001,
    FailedToDecodePayload = 4002,
    NotAuthenticated = 4003,
    AuthenticationFailed = 4004,
    AlreadyAuthenticated = 4005,
    SessionNoLongerValid = 4006,
    SessionTimeout = 4009,
    ServerNotFound = 4011,
    UnknownProtocol = 4012,
    Disconnected = 4014,
    VoiceServerCrashed = 4015,
    UnknownEncryptionMode = 4016,
}

impl TryFrom<u16> for VoiceCloseCode {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            4001 => Ok(VoiceCloseCode::UnknownOpcode),
            4002 => Ok(VoiceCloseCode::FailedToDecodePayload),
            4003 => Ok(VoiceCloseCode::NotAuthenticated),
            4004 => Ok(VoiceCloseCode::AuthenticationFailed),
            4005 => Ok(VoiceCloseCode::AlreadyAuthenticated),
            4006 => Ok(VoiceCloseCode::SessionNoLongerValid),
            4009 => Ok(VoiceCloseCode::SessionTimeout),
            4011 => Ok(VoiceCloseCode::ServerNotFound),
            4012 => Ok(VoiceCloseCode::UnknownProtocol),
            4014 => Ok(VoiceCloseCode::Disconnected),
            4015 => Ok(VoiceCloseCode::VoiceServerCrashed),
            4016 => Ok(VoiceCloseCode::UnknownEncryptionMode),
            _ => Err(()),
        }
    }
}

impl From<VoiceCloseCode> for crate::errors::VoiceGatewayError {
    fn from(code: VoiceCloseCode) -> Self {
        use crate::errors::VoiceGatewayError::*;
        match code {
            VoiceCloseCode::UnknownOpcode => UnknownOpcode,
            VoiceCloseCode::FailedToDecodePayload => FailedToDecodePayload,
            VoiceCloseCode::NotAuthenticated => NotAuthenticated,
            VoiceCloseCode::AuthenticationFailed => AuthenticationFailed,
            VoiceCloseCode::AlreadyAuthenticated => AlreadyAuthenticated,
            VoiceCloseCode::SessionNoLongerValid => SessionNoLongerValid,
            VoiceCloseCode::SessionTimeout => SessionTimeout,
            VoiceCloseCode::ServerNotFound => ServerNotFound,
            VoiceCloseCode::UnknownProtocol => UnknownProtocol,
            VoiceCloseCode::Disconnected => Disconnected,
            VoiceCloseCode::VoiceServerCrashed => VoiceServerCrashed,
            VoiceCloseCode::UnknownEncryptionMode => UnknownEncryptionMode,
        }
    }
}
