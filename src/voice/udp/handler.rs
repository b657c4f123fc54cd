// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use discortp::demux::{demux, Demuxed};
use discortp::discord::{
    IpDiscovery, IpDiscoveryPacket, IpDiscoveryType, MutableIpDiscoveryPacket,
};
use discortp::Packet;
use log::*;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::dave::OPUS_SILENCE_PACKET;
use crate::errors::VoiceUdpError;
use crate::voice::courier::{
    self, CourierHandle, DecryptorMap, ParkedPayload, ParkingLot,
};
use crate::voice::events::{VoiceBufferSendEvent, VoiceClientEvents, VoiceTrackMarkerEvent};
use crate::voice::voice_data::VoiceData;

use super::{
    encrypt_voice_packet, OutboundQueue, SendAudioType, UdpBackend, UdpHandle, UdpSocket,
    AUDIO_OVERLAP_SLEEP_SAMPLES, STOP_FRAME_COUNT, TIMESCALE_NS,
};

/// Packets smaller than this can't be voice audio (silence bursts and
/// probes); they are thrown away.
const MIN_VOICE_PACKET_SIZE: usize = 44;

/// The main UDP struct, which handles receiving and staging rtp packets and
/// pacing the outbound queue.
#[derive(Debug)]
pub struct UdpHandler {
    pub data: Arc<RwLock<VoiceData>>,
    socket: Arc<UdpSocket>,
    courier: CourierHandle,
    kill_receive: tokio::sync::broadcast::Receiver<()>,
}

impl UdpHandler {
    /// Spawns the UDP handler: connects the socket, performs IP discovery
    /// (stored into `data_reference`), and starts the listener, sender and
    /// courier tasks.
    pub async fn spawn(
        data_reference: Arc<RwLock<VoiceData>>,
        url: SocketAddr,
        ssrc: u32,
        events: Arc<Mutex<VoiceClientEvents>>,
        courier_handle: CourierHandle,
        decryptors: Arc<std::sync::Mutex<DecryptorMap>>,
    ) -> Result<UdpHandle, VoiceUdpError> {
        let udp_socket = UdpBackend::connect(url).await?;

        // First perform ip discovery
        let ip_discovery = IpDiscovery {
            pkt_type: IpDiscoveryType::Request,
            ssrc,
            length: 70,
            address: Vec::new(),
            port: 0,
            payload: Vec::new(),
        };

        // Minimum size with an empty Address value, + 64 bytes for the actual address size
        let size = IpDiscoveryPacket::minimum_packet_size() + 64;

        let mut buf: Vec<u8> = vec![0; size];

        let mut ip_discovery_packet = MutableIpDiscoveryPacket::new(&mut buf)
            .expect("the ip discovery buffer size is statically sufficient");
        ip_discovery_packet.populate(&ip_discovery);

        let discovery_bytes = ip_discovery_packet.packet();

        debug!("VUDP: Sending Ip Discovery {:?}", &discovery_bytes);

        if let Err(e) = udp_socket.send(discovery_bytes).await {
            return Err(VoiceUdpError::BrokenSocket {
                error: format!("{:?}", e),
            });
        }

        debug!("VUDP: Sent ip discovery request");

        // Handle the ip discovery response
        if let Err(e) = udp_socket.recv(&mut buf).await {
            return Err(VoiceUdpError::BrokenSocket {
                error: format!("{:?}", e),
            });
        }

        let Some(received_ip_discovery) = IpDiscoveryPacket::new(&buf) else {
            warn!("VUDP: Could not parse the ip discovery response");
            return Err(VoiceUdpError::FailedIpDiscovery);
        };

        if received_ip_discovery.get_pkt_type() != IpDiscoveryType::Response {
            warn!("VUDP: Ip discovery response has the wrong type");
            return Err(VoiceUdpError::FailedIpDiscovery);
        }

        debug!("VUDP: Received ip discovery: {:?}", received_ip_discovery);

        // The address is a null terminated 64 byte string
        let address_bytes = received_ip_discovery.get_address();
        let address = String::from_utf8_lossy(&address_bytes)
            .trim_end_matches('\0')
            .to_string();
        let port = received_ip_discovery.get_port();

        if address.is_empty() {
            warn!("VUDP: Ip discovery returned an empty address");
            return Err(VoiceUdpError::FailedIpDiscovery);
        }

        {
            let mut data_lock = data_reference.write().await;
            data_lock.external_address = Some((address, port));
        }

        let socket = Arc::new(udp_socket);
        let outbound = Arc::new(Mutex::new(OutboundQueue::default()));
        let outbound_notify = Arc::new(Notify::new());

        let (kill_send, kill_receive) = tokio::sync::broadcast::channel::<()>(16);

        let mut handler = UdpHandler {
            data: data_reference.clone(),
            socket: socket.clone(),
            courier: courier_handle.clone(),
            kill_receive,
        };

        // Now we can continuously check for messages in a different task
        tokio::spawn(async move {
            handler.listen_task().await;
        });

        tokio::spawn(send_task(
            socket.clone(),
            data_reference.clone(),
            outbound.clone(),
            outbound_notify.clone(),
            events.clone(),
            kill_send.subscribe(),
        ));

        courier::spawn_courier(
            courier_handle,
            data_reference.clone(),
            decryptors,
            events,
        );

        Ok(UdpHandle {
            data: data_reference,
            socket,
            outbound,
            outbound_notify,
            kill_send,
        })
    }

    /// The main listen task;
    ///
    /// Receives UDP messages and stages them for the courier.
    async fn listen_task(&mut self) {
        let mut buf: Vec<u8> = vec![0; 65535];

        loop {
            tokio::select! {
                Ok(_) = self.kill_receive.recv() => {
                    trace!("VUDP: Closing listener task");
                    break;
                }
                result = self.socket.recv(&mut buf) => {
                    match result {
                        Ok(size) => self.handle_message(&buf[0..size]).await,
                        Err(e) => {
                            warn!("VUDP: Voice UDP is broken ({e}), closing connection");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Stages one received datagram into the speaker's parking lot.
    async fn handle_message(&self, buf: &[u8]) {
        if buf.len() < MIN_VOICE_PACKET_SIZE {
            return;
        }

        match demux(buf) {
            Demuxed::Rtp(rtp) => {
                trace!("VUDP: Parsed packet as rtp!");

                let ssrc = rtp.get_ssrc();
                let seq: u16 = rtp.get_sequence().into();
                let timestamp: u32 = rtp.get_timestamp().into();

                let Some(user_id) = self.data.read().await.user_for_ssrc(ssrc) else {
                    trace!("VUDP: Dropping rtp from unmapped ssrc {ssrc}");
                    return;
                };

                {
                    let mut shared = self
                        .courier
                        .shared
                        .lock()
                        .expect("courier state mutex poisoned");

                    let parking_lot = shared
                        .parked_voice_payloads
                        .entry(user_id)
                        .or_insert_with(ParkingLot::default);

                    if parking_lot.decoder.is_none() {
                        // First packet from this speaker: set up the decoder
                        // and the deliverable window
                        let Some(decoder) = courier::create_decoder() else {
                            return;
                        };
                        parking_lot.decoder = Some(decoder);
                        parking_lot.min_seq = seq;
                        parking_lot.min_timestamp = timestamp;
                    }

                    if seq < parking_lot.min_seq && timestamp < parking_lot.min_timestamp {
                        // This packet arrived too late, discard it
                        return;
                    }

                    parking_lot.max_seq = seq;
                    parking_lot.max_timestamp = timestamp;
                    parking_lot.parked_payloads.push(ParkedPayload {
                        seq,
                        timestamp,
                        packet: buf.to_vec(),
                    });
                }

                self.courier.notify.notify_one();
            }
            Demuxed::Rtcp(_) => {
                // Receiver reports; nothing to do with them
                trace!("VUDP: Parsed packet as rtcp!");
            }
            Demuxed::FailedParse(e) => {
                trace!("VUDP: Failed to parse packet: {:?}", e);
            }
            Demuxed::TooSmall => {}
        }
    }
}

/// Sends 5 transport-encrypted silence frames immediately, so that
/// receiving clients notice the stream stopping right away.
pub(crate) async fn send_stop_frames(socket: &UdpSocket, data: &Arc<RwLock<VoiceData>>) {
    for _ in 0..STOP_FRAME_COUNT {
        match encrypt_voice_packet(data, &OPUS_SILENCE_PACKET, 20).await {
            Ok(packet) => {
                if let Err(e) = socket.send(&packet).await {
                    warn!("VUDP: Failed to send stop frame: {e}");
                    return;
                }
            }
            Err(e) => {
                trace!("VUDP: Not sending stop frames: {e}");
                return;
            }
        }
    }
}

/// The sender task: drains the outbound queue in order, pacing by each
/// packet's duration, and fires track marker and buffer events.
async fn send_task(
    socket: Arc<UdpSocket>,
    data: Arc<RwLock<VoiceData>>,
    outbound: Arc<Mutex<OutboundQueue>>,
    outbound_notify: Arc<Notify>,
    events: Arc<Mutex<VoiceClientEvents>>,
    mut kill_receive: tokio::sync::broadcast::Receiver<()>,
) {
    let mut last_timestamp = Instant::now();
    let mut last_sleep_remainder = Duration::ZERO;

    loop {
        if kill_receive.try_recv().is_ok() {
            trace!("VUDP: Closing sender task");
            break;
        }

        // Pausing keeps the queue; stop frames are sent once per pause
        {
            let data_read = data.read().await;
            if data_read.paused {
                let needs_stop_frames = !data_read.sent_stop_frames;
                drop(data_read);

                if needs_stop_frames {
                    send_stop_frames(&socket, &data).await;
                    data.write().await.sent_stop_frames = true;
                }

                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            }
        }

        enum Tick {
            Marker(String),
            Packet { bytes: Vec<u8>, duration: u64, mode: SendAudioType, packets_left: usize },
            Empty,
        }

        let tick = {
            let mut queue = outbound.lock().await;
            match queue.packets.front() {
                Some(packet) if packet.is_track_marker() => {
                    queue.packets.pop_front();
                    if queue.tracks > 0 {
                        queue.tracks -= 1;
                    }
                    let meta = queue.track_meta.pop_front().unwrap_or_default();
                    Tick::Marker(meta)
                }
                Some(_) => {
                    let packet = queue.packets.pop_front().expect("peeked above");
                    Tick::Packet {
                        bytes: packet.bytes,
                        duration: packet.duration,
                        mode: queue.send_audio_type,
                        packets_left: queue.packets.len(),
                    }
                }
                None => Tick::Empty,
            }
        };

        match tick {
            Tick::Marker(track_meta) => {
                events
                    .lock()
                    .await
                    .track_marker
                    .publish(VoiceTrackMarkerEvent { track_meta })
                    .await;
            }
            Tick::Packet {
                bytes,
                duration,
                mode,
                packets_left,
            } => {
                let buffer_size = bytes.len();
                if let Err(e) = socket.send(&bytes).await {
                    warn!("VUDP: Voice UDP is broken ({e}), closing sender");
                    break;
                }

                let duration_ns = Duration::from_nanos(duration * TIMESCALE_NS);
                let latency = last_timestamp.elapsed();

                match mode {
                    SendAudioType::Recorded => {
                        let sleep_time = duration_ns.saturating_sub(latency);
                        if !sleep_time.is_zero() {
                            tokio::time::sleep(sleep_time).await;
                        }
                        last_sleep_remainder = Duration::ZERO;
                    }
                    SendAudioType::Overlap => {
                        // Overlap mode splits the sleep into slices and
                        // carries the timing error over to the next packet
                        let mut sleep_time = (duration_ns + last_sleep_remainder)
                            .saturating_sub(latency);
                        let sleep_increment =
                            duration_ns.saturating_sub(latency) / AUDIO_OVERLAP_SLEEP_SAMPLES;

                        if !sleep_time.is_zero() && !sleep_increment.is_zero() {
                            let mut samples_count: u32 = 0;
                            let mut overshoot_accumulator = Duration::ZERO;

                            loop {
                                let start_sleep = Instant::now();
                                tokio::time::sleep(sleep_increment).await;
                                let slept = start_sleep.elapsed();

                                samples_count += 1;
                                overshoot_accumulator +=
                                    slept.saturating_sub(sleep_increment);
                                sleep_time = sleep_time.saturating_sub(slept);

                                let average_overshoot =
                                    overshoot_accumulator / samples_count;
                                if average_overshoot + sleep_increment >= sleep_time {
                                    break;
                                }
                            }
                            last_sleep_remainder = sleep_time;
                        } else {
                            last_sleep_remainder = Duration::ZERO;
                        }
                    }
                }

                last_timestamp = Instant::now();

                events
                    .lock()
                    .await
                    .buffer_send
                    .publish(VoiceBufferSendEvent {
                        buffer_size,
                        packets_left,
                    })
                    .await;
            }
            Tick::Empty => {
                tokio::select! {
                    Ok(_) = kill_receive.recv() => {
                        trace!("VUDP: Closing sender task");
                        break;
                    }
                    _ = outbound_notify.notified() => {}
                }
            }
        }
    }
}
