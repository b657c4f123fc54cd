// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Contains all the errors that can be returned by the library.

use custom_error::custom_error;

use crate::types::WebSocketEvent;

custom_error! {
    /// Voice gateway errors.
    ///
    /// Most of these are close codes the voice gateway can terminate the
    /// connection with.
    ///
    /// See <https://discord.com/developers/docs/topics/opcodes-and-status-codes#voice-voice-close-event-codes>;
    #[derive(Clone, Default, PartialEq, Eq)]
    pub VoiceGatewayError
    // Errors we receive
    #[default]
    UnknownOpcode = "You sent an invalid opcode",
    FailedToDecodePayload = "You sent an invalid payload in your identifying to the (Voice) Gateway",
    NotAuthenticated = "You sent a payload before identifying with the (Voice) Gateway",
    AuthenticationFailed = "The token you sent in your identify payload is incorrect",
    AlreadyAuthenticated = "You sent more than one identify payload",
    SessionNoLongerValid = "Your session is no longer valid",
    SessionTimeout = "Your session has timed out",
    ServerNotFound = "We can't find the server you're trying to connect to",
    UnknownProtocol = "We didn't recognize the protocol you sent",
    Disconnected = "Channel was deleted, you were kicked, voice server changed, or the main gateway session was dropped.",
    VoiceServerCrashed = "The server crashed",
    UnknownEncryptionMode = "Server failed to decrypt data",

    // Errors when initiating a gateway connection
    CannotConnect{error: String} = "Cannot connect due to a tungstenite error: {error}",
    NonHelloOnInitiate{opcode: u8} = "Received non hello on initial gateway connection ({opcode}), something is definitely wrong",

    // Other misc errors
    UnexpectedOpcodeReceived{opcode: u8} = "Received an opcode we weren't expecting to receive: {opcode}",
}

impl VoiceGatewayError {
    /// Whether the voice session can be salvaged after this error.
    ///
    /// Close codes 4004..=4016 terminate the session for good, with the
    /// exception of 4014 (disconnected, e.g. a region change), after which a
    /// fresh connect can be attempted. Network-level connect failures are
    /// always worth retrying.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            VoiceGatewayError::AuthenticationFailed
                | VoiceGatewayError::AlreadyAuthenticated
                | VoiceGatewayError::SessionNoLongerValid
                | VoiceGatewayError::SessionTimeout
                | VoiceGatewayError::ServerNotFound
                | VoiceGatewayError::UnknownProtocol
                | VoiceGatewayError::VoiceServerCrashed
                | VoiceGatewayError::UnknownEncryptionMode
        )
    }
}

impl WebSocketEvent for VoiceGatewayError {}

custom_error! {
    /// Voice UDP errors.
    #[derive(Clone, PartialEq, Eq)]
    pub VoiceUdpError

    // General errors
    BrokenSocket{error: String} = "Could not write / read from UDP socket: {error}",
    NoData = "We have not yet received the necessary data to perform this operation.",

    // Encryption errors
    NoKey = "Tried to encrypt / decrypt rtp data, but no key has been received yet",
    FailedEncryption = "Tried to encrypt rtp data, but failed",
    FailedDecryption = "Tried to decrypt rtp data, but failed",
    FailedIpDiscovery = "The voice server did not send a valid response to our ip discovery request",

    // Input validation errors
    InvalidAudioLength = "Raw audio must be at least 4 bytes long and a multiple of 4 bytes",

    // Errors when initiating a socket connection
    CannotBind{error: String} = "Cannot bind socket due to a UDP error: {error}",
    CannotConnect{error: String} = "Cannot connect due to a UDP error: {error}",

    // Opus errors
    OpusError{error: String} = "Opus error: {error}",
}

impl WebSocketEvent for VoiceUdpError {}

custom_error! {
    /// Errors from the DAVE end-to-end encryption layer.
    #[derive(Clone, PartialEq, Eq)]
    pub DaveError

    EncryptionFailure = "Failed to encrypt a media frame",
    DecryptionFailure = "Failed to decrypt a media frame",
    NoKeyRatchet = "No key ratchet is bound, cannot encrypt",
    CodecValidationFailed = "Ciphertext kept producing packetizer-breaking byte sequences",
    UnsupportedCodec = "Unsupported codec for frame encryption",
    MlsFailure{reason: String} = "MLS processing failure: {reason}",
    KeyStorage{reason: String} = "Failed to persist or load a signature key pair: {reason}",
}

impl WebSocketEvent for DaveError {}
