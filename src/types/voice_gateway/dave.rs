// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Payload types for the DAVE protocol opcodes.
//!
//! Opcodes 21..=24 and 31 travel as JSON text frames like every other voice
//! gateway event. The MLS messages themselves (opcodes 25..=30) travel as
//! binary websocket frames, described by [DaveBinaryMessage].

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use super::{VOICE_DAVE_MLS_ANNOUNCE_COMMIT_TRANSITION, VOICE_DAVE_MLS_WELCOME};
use crate::types::WebSocketEvent;

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq, Copy)]
/// Announces an upcoming protocol version transition, most importantly a
/// downgrade to version 0.
///
/// A transition id of 0 is for (re)initialization and is executed immediately.
pub struct DavePrepareTransition {
    pub transition_id: u16,
    pub protocol_version: u8,
}

impl WebSocketEvent for DavePrepareTransition {}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq, Copy)]
/// Orders the client to apply a previously prepared transition.
pub struct DaveExecuteTransition {
    pub transition_id: u16,
}

impl WebSocketEvent for DaveExecuteTransition {}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq, Copy)]
/// Tells the gateway we are ready to execute a transition. Sent by the client.
pub struct DaveTransitionReady {
    pub transition_id: u16,
}

impl WebSocketEvent for DaveTransitionReady {}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq, Copy)]
/// Announces an upcoming MLS epoch. Epoch 1 means a fresh MLS group is being
/// formed and the client should (re)initialize its DAVE session.
pub struct DavePrepareEpoch {
    pub protocol_version: u8,
    pub epoch: u32,
}

impl WebSocketEvent for DavePrepareEpoch {}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq, Copy)]
/// Tells the gateway we could not process a commit or welcome and need to be
/// re-added to the group. Sent by the client.
pub struct DaveInvalidCommitWelcome {
    pub transition_id: u16,
}

impl WebSocketEvent for DaveInvalidCommitWelcome {}

/// A binary frame received from the voice gateway.
///
/// Layout (big-endian): `u16 seq | u8 opcode | [u16 transition_id] | payload`,
/// where the transition id is present only for opcodes 29
/// (announce commit transition) and 30 (MLS welcome).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaveBinaryMessage {
    pub seq: u16,
    pub op_code: u8,
    pub transition_id: Option<u16>,
    pub data: Vec<u8>,
}

impl DaveBinaryMessage {
    /// Parses a binary websocket frame into its header and MLS payload.
    pub fn parse(buffer: &[u8]) -> Option<DaveBinaryMessage> {
        if buffer.len() < 3 {
            return None;
        }

        let seq = BigEndian::read_u16(&buffer[0..2]);
        let op_code = buffer[2];

        let has_transition_id = op_code == VOICE_DAVE_MLS_ANNOUNCE_COMMIT_TRANSITION
            || op_code == VOICE_DAVE_MLS_WELCOME;

        if has_transition_id {
            if buffer.len() < 5 {
                return None;
            }
            Some(DaveBinaryMessage {
                seq,
                op_code,
                transition_id: Some(BigEndian::read_u16(&buffer[3..5])),
                data: buffer[5..].to_vec(),
            })
        } else {
            Some(DaveBinaryMessage {
                seq,
                op_code,
                transition_id: None,
                data: buffer[3..].to_vec(),
            })
        }
    }

    /// Frames an outbound binary payload: a single opcode byte followed by
    /// the MLS message bytes.
    pub fn frame_outbound(op_code: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + payload.len());
        out.push(op_code);
        out.extend_from_slice(payload);
        out
    }
}

impl WebSocketEvent for DaveBinaryMessage {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{VOICE_DAVE_MLS_PROPOSALS, VOICE_DAVE_MLS_WELCOME};

    #[test]
    fn parse_without_transition_id() {
        let buffer = [0x00, 0x2a, VOICE_DAVE_MLS_PROPOSALS, 0xde, 0xad];
        let parsed = DaveBinaryMessage::parse(&buffer).unwrap();
        assert_eq!(parsed.seq, 42);
        assert_eq!(parsed.op_code, VOICE_DAVE_MLS_PROPOSALS);
        assert_eq!(parsed.transition_id, None);
        assert_eq!(parsed.data, vec![0xde, 0xad]);
    }

    #[test]
    fn parse_with_transition_id() {
        let buffer = [0x01, 0x00, VOICE_DAVE_MLS_WELCOME, 0x00, 0x07, 0x01];
        let parsed = DaveBinaryMessage::parse(&buffer).unwrap();
        assert_eq!(parsed.seq, 256);
        assert_eq!(parsed.transition_id, Some(7));
        assert_eq!(parsed.data, vec![0x01]);
    }

    #[test]
    fn parse_too_short() {
        assert_eq!(DaveBinaryMessage::parse(&[0x00, 0x01]), None);
        let short_welcome = [0x00, 0x00, VOICE_DAVE_MLS_WELCOME, 0x00];
        assert_eq!(DaveBinaryMessage::parse(&short_welcome), None);
    }
}
