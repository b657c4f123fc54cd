// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Defines the UDP component of voice communications, sending and receiving
//! encrypted rtp data.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::errors::VoiceUdpError;
use crate::voice::voice_data::VoiceData;

/// See <https://discord.com/developers/docs/topics/voice-connections#voice-packet-structure>
/// This always adds up to 12 bytes
pub(crate) const RTP_HEADER_SIZE: usize = 12;

/// Sentinel queued between tracks; too small to be a valid RTP packet, so
/// the sender knows to fire an event instead of sending it.
pub(crate) const AUDIO_TRACK_MARKER: [u8; 2] = [0xff, 0xff];

/// Nanoseconds per duration unit of a queued packet (durations are in
/// milliseconds).
pub(crate) const TIMESCALE_NS: u64 = 1_000_000;

/// How many slices an overlap-mode pacing sleep is divided into.
pub(crate) const AUDIO_OVERLAP_SLEEP_SAMPLES: u32 = 30;

/// How many silence frames are sent when audio is paused or stopped, so
/// receivers perceive an immediate cutoff.
pub(crate) const STOP_FRAME_COUNT: usize = 5;

pub mod backends;
pub mod handle;
pub mod handler;

pub use backends::*;
pub use handle::*;
pub use handler::*;

/// How pacing sleeps between packets are performed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SendAudioType {
    /// One sleep per packet; for audio recorded ahead of time.
    #[default]
    Recorded,
    /// Sliced sleeps accumulating the timing error, which keeps live audio
    /// overlapping smoothly.
    Overlap,
}

/// One queued outbound packet (already fully encrypted), or a track marker.
#[derive(Debug, Clone)]
pub struct VoiceOutPacket {
    pub bytes: Vec<u8>,
    /// Playback duration in milliseconds; 0 for markers
    pub duration: u64,
}

impl VoiceOutPacket {
    pub fn is_track_marker(&self) -> bool {
        self.bytes == AUDIO_TRACK_MARKER
    }
}

/// The outbound packet queue and its track bookkeeping; shared between the
/// public send surface and the sender task under one mutex.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    pub packets: VecDeque<VoiceOutPacket>,
    pub track_meta: VecDeque<String>,
    pub tracks: u32,
    pub send_audio_type: SendAudioType,
}

impl OutboundQueue {
    /// Seconds of audio still queued.
    pub fn secs_remaining(&self) -> f32 {
        self.packets
            .iter()
            .map(|packet| packet.duration as f32 * (TIMESCALE_NS as f32 / 1_000_000_000.0))
            .sum()
    }

    /// Erases all queued packets up to and including the next track marker.
    pub fn skip_to_next_marker(&mut self) {
        match self
            .packets
            .iter()
            .position(VoiceOutPacket::is_track_marker)
        {
            Some(marker) => {
                self.packets.drain(..=marker);
            }
            None => self.packets.clear(),
        }

        if self.tracks > 0 {
            self.tracks -= 1;
        }
        self.track_meta.pop_front();
    }
}

/// Seals `payload` into a ready-to-send RTP packet, advancing the session's
/// sequence number, timestamp and packet nonce.
pub(crate) async fn encrypt_voice_packet(
    data: &Arc<RwLock<VoiceData>>,
    payload: &[u8],
    duration_ms: u64,
) -> Result<Vec<u8>, VoiceUdpError> {
    let mut data_lock = data.write().await;

    let Some(ssrc) = data_lock.ssrc() else {
        return Err(VoiceUdpError::NoData);
    };
    let Some(secret_key) = data_lock.secret_key.clone() else {
        return Err(VoiceUdpError::NoKey);
    };

    data_lock.sequence = data_lock.sequence.wrapping_add(1);
    let header =
        super::crypto::build_rtp_header(data_lock.sequence, data_lock.timestamp, ssrc);

    let packet =
        super::crypto::encrypt_rtp_packet(&secret_key, data_lock.packet_nonce, &header, payload)?;

    data_lock.packet_nonce = data_lock.packet_nonce.wrapping_add(1);
    data_lock.timestamp = data_lock
        .timestamp
        .wrapping_add(super::opus::timestamp_increment(duration_ms));

    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(duration: u64) -> VoiceOutPacket {
        VoiceOutPacket {
            bytes: vec![0u8; 64],
            duration,
        }
    }

    fn marker() -> VoiceOutPacket {
        VoiceOutPacket {
            bytes: AUDIO_TRACK_MARKER.to_vec(),
            duration: 0,
        }
    }

    #[test]
    fn secs_remaining_sums_durations() {
        let mut queue = OutboundQueue::default();
        queue.packets.push_back(packet(20));
        queue.packets.push_back(packet(60));
        assert!((queue.secs_remaining() - 0.08).abs() < f32::EPSILON);
    }

    #[test]
    fn skip_to_next_marker_erases_through_marker() {
        let mut queue = OutboundQueue::default();
        queue.packets.push_back(packet(20));
        queue.packets.push_back(marker());
        queue.packets.push_back(packet(20));
        queue.tracks = 2;
        queue.track_meta.push_back("first".to_string());
        queue.track_meta.push_back("second".to_string());

        queue.skip_to_next_marker();

        assert_eq!(queue.packets.len(), 1);
        assert!(!queue.packets[0].is_track_marker());
        assert_eq!(queue.tracks, 1);
        assert_eq!(queue.track_meta.front().map(String::as_str), Some("second"));
    }

    #[test]
    fn skip_without_marker_clears_queue() {
        let mut queue = OutboundQueue::default();
        queue.packets.push_back(packet(20));
        queue.packets.push_back(packet(20));
        queue.skip_to_next_marker();
        assert!(queue.packets.is_empty());
    }
}
