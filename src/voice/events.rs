// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Events the voice client surfaces to the host application.
//!
//! Subscribe with a [pubserve::Subscriber]; note that receive events are
//! published from the courier task, so handlers must not block.

use pubserve::Publisher;

use crate::errors::VoiceGatewayError;
use crate::types::{Snowflake, Speaking, VoiceClientDisconnection, WebSocketEvent};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
/// The voice connection is fully established and media can flow.
pub struct VoiceReadyEvent {
    pub channel_id: Snowflake,
    pub ssrc: u32,
}

impl WebSocketEvent for VoiceReadyEvent {}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
/// An outbound packet left the queue.
pub struct VoiceBufferSendEvent {
    /// Size of the packet just sent, in bytes
    pub buffer_size: usize,
    /// Packets still queued
    pub packets_left: usize,
}

impl WebSocketEvent for VoiceBufferSendEvent {}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
/// The sender reached a track marker in the outbound queue.
pub struct VoiceTrackMarkerEvent {
    /// The metadata given to [insert_marker](crate::voice::VoiceHandler::insert_marker)
    pub track_meta: String,
}

impl WebSocketEvent for VoiceTrackMarkerEvent {}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
/// Decoded audio from a single speaker.
pub struct VoiceReceiveEvent {
    pub user_id: Snowflake,
    pub ssrc: u32,
    /// 48 kHz interleaved stereo PCM
    pub audio: Vec<i16>,
}

impl WebSocketEvent for VoiceReceiveEvent {}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
/// Decoded audio of all speakers of one courier iteration, mixed.
pub struct VoiceReceiveCombinedEvent {
    /// 48 kHz interleaved stereo PCM
    pub audio: Vec<i16>,
}

impl WebSocketEvent for VoiceReceiveCombinedEvent {}

/// Everything the host can observe about one voice session.
#[derive(Default, Debug)]
pub struct VoiceClientEvents {
    pub ready: Publisher<VoiceReadyEvent>,
    pub buffer_send: Publisher<VoiceBufferSendEvent>,
    pub track_marker: Publisher<VoiceTrackMarkerEvent>,
    pub receive: Publisher<VoiceReceiveEvent>,
    pub receive_combined: Publisher<VoiceReceiveCombinedEvent>,
    pub client_speaking: Publisher<Speaking>,
    pub client_disconnect: Publisher<VoiceClientDisconnection>,
    pub error: Publisher<VoiceGatewayError>,
}
