// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use log::*;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::errors::VoiceUdpError;
use crate::voice::voice_data::VoiceData;

use super::{
    encrypt_voice_packet, OutboundQueue, SendAudioType, UdpSocket, VoiceOutPacket,
    AUDIO_TRACK_MARKER,
};

/// Handle to a voice UDP connection.
///
/// Can be safely cloned and will still correspond to the same connection.
#[derive(Debug, Clone)]
pub struct UdpHandle {
    pub data: Arc<RwLock<VoiceData>>,
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) outbound: Arc<Mutex<OutboundQueue>>,
    pub(crate) outbound_notify: Arc<Notify>,
    pub(crate) kill_send: tokio::sync::broadcast::Sender<()>,
}

impl UdpHandle {
    /// Seals an (optionally DAVE-wrapped) Opus payload into an RTP packet
    /// and queues it, or sends it immediately when `send_now` is set.
    ///
    /// # Errors
    /// [VoiceUdpError::NoData] before the ready event delivered our ssrc,
    /// [VoiceUdpError::NoKey] before the session description delivered the
    /// secret key, [VoiceUdpError::BrokenSocket] when an immediate send
    /// fails.
    pub async fn send_payload(
        &self,
        payload: &[u8],
        duration_ms: u64,
        send_now: bool,
    ) -> Result<(), VoiceUdpError> {
        let packet = encrypt_voice_packet(&self.data, payload, duration_ms).await?;

        if send_now {
            if let Err(e) = self.socket.send(&packet).await {
                return Err(VoiceUdpError::BrokenSocket {
                    error: format!("{:?}", e),
                });
            }
            trace!("VUDP: Sent rtp packet!");
        } else {
            let mut outbound = self.outbound.lock().await;
            outbound.packets.push_back(VoiceOutPacket {
                bytes: packet,
                duration: duration_ms,
            });
            drop(outbound);
            self.outbound_notify.notify_one();
        }

        Ok(())
    }

    /// Queues a track marker. The sender fires a
    /// [VoiceTrackMarkerEvent](crate::voice::events::VoiceTrackMarkerEvent)
    /// with `metadata` when it reaches it.
    pub async fn insert_marker(&self, metadata: String) {
        let mut outbound = self.outbound.lock().await;
        outbound.packets.push_back(VoiceOutPacket {
            bytes: AUDIO_TRACK_MARKER.to_vec(),
            duration: 0,
        });
        outbound.track_meta.push_back(metadata);
        outbound.tracks += 1;
        drop(outbound);
        self.outbound_notify.notify_one();
    }

    /// Seconds of audio still queued for sending.
    pub async fn get_secs_remaining(&self) -> f32 {
        self.outbound.lock().await.secs_remaining()
    }

    /// Tracks still queued, including the currently playing one.
    pub async fn get_tracks_remaining(&self) -> u32 {
        let outbound = self.outbound.lock().await;
        if outbound.packets.is_empty() {
            0
        } else {
            outbound.tracks + 1
        }
    }

    /// Metadata of all queued track markers.
    pub async fn get_marker_metadata(&self) -> Vec<String> {
        self.outbound.lock().await.track_meta.iter().cloned().collect()
    }

    pub async fn is_playing(&self) -> bool {
        !self.outbound.lock().await.packets.is_empty()
    }

    /// Skips everything queued up to and including the next track marker.
    pub async fn skip_to_next_marker(&self) {
        self.outbound.lock().await.skip_to_next_marker();
    }

    pub async fn set_send_audio_type(&self, send_audio_type: SendAudioType) {
        self.outbound.lock().await.send_audio_type = send_audio_type;
    }

    /// Pauses or resumes the sender. The queue is kept; on the first paused
    /// tick the sender emits stop frames so clients hear an immediate
    /// cutoff.
    pub async fn pause(&self, pause: bool) {
        let mut data = self.data.write().await;
        data.paused = pause;
        if !pause {
            data.sent_stop_frames = false;
        }
        drop(data);
        self.outbound_notify.notify_one();
    }

    /// Clears the queue and all track bookkeeping, then sends stop frames.
    pub async fn stop_audio(&self) {
        {
            let mut outbound = self.outbound.lock().await;
            outbound.packets.clear();
            outbound.track_meta.clear();
            outbound.tracks = 0;
        }
        super::handler::send_stop_frames(&self.socket, &self.data).await;
    }

    /// Closes the UDP tasks (listener, sender and courier wind down via the
    /// kill channel and terminating flag).
    pub fn close(&self) {
        let _ = self.kill_send.send(());
    }
}
