// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::HashMap;

use zeroize::Zeroizing;

use crate::types::{Snowflake, VoiceReady};

/// Saves data shared between parts of the voice architecture;
///
/// Gives the UDP connection and the courier the session state negotiated
/// over the voice gateway.
#[derive(Debug, Default)]
pub struct VoiceData {
    // Identity of the session
    /// The guild id, or the private channel id for DM calls
    pub server_id: Snowflake,
    pub channel_id: Snowflake,
    pub user_id: Snowflake,
    pub session_id: String,
    pub token: String,
    /// Voice gateway host (host:port)
    pub endpoint: String,

    pub ready_data: Option<VoiceReady>,

    /// Our external address, found via ip discovery
    pub external_address: Option<(String, u16)>,

    /// The transport secret key from the session description
    pub secret_key: Option<Zeroizing<[u8; 32]>>,

    /// The negotiated DAVE protocol version (0 = no end-to-end encryption)
    pub dave_version: u8,

    /// The last RTP sequence number we used, incremented every packet we send
    pub sequence: u16,
    /// The RTP timestamp, advanced by the sample count of every packet
    pub timestamp: u32,
    /// The transport encryption nonce; reset to 1 whenever a new secret key
    /// is installed, incremented every packet. A nonce never repeats under
    /// the same key.
    pub packet_nonce: u32,

    /// Which user an RTP synchronization source belongs to
    pub ssrc_map: HashMap<u32, Snowflake>,

    /// The last sequence number received from the gateway, echoed in
    /// heartbeats and resumes
    pub receive_sequence: i32,

    // State flags
    /// Whether we've already announced ourselves as speaking
    pub speaking: bool,
    pub paused: bool,
    /// Whether stop frames were sent since the last pause
    pub sent_stop_frames: bool,
    pub terminating: bool,
}

impl VoiceData {
    pub fn ssrc(&self) -> Option<u32> {
        self.ready_data.as_ref().map(|ready| ready.ssrc)
    }

    pub fn user_for_ssrc(&self, ssrc: u32) -> Option<Snowflake> {
        self.ssrc_map.get(&ssrc).copied()
    }
}
