// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The voice courier: a background task that drains the per-speaker parking
//! lots, decrypts and decodes the staged packets in sequence order, and
//! dispatches per-speaker and combined PCM to the host.

use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use audiopus::coder::{Decoder, GenericCtl};
use audiopus::{Channels, SampleRate};
use byteorder::{BigEndian, ByteOrder};
use log::*;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::dave::decryptor::Decryptor;
use crate::dave::MediaType;
use crate::types::Snowflake;
use crate::voice::events::{VoiceClientEvents, VoiceReceiveCombinedEvent, VoiceReceiveEvent};
use crate::voice::voice_data::VoiceData;

use super::crypto;
use super::opus::OPUS_CHANNEL_COUNT;

/// Enough room for one 120 ms stereo frame, the largest Opus will produce.
const DECODE_BUFFER_SAMPLES: usize = 5760 * OPUS_CHANNEL_COUNT;

/// Upmixed accumulator size: 120 ms of stereo for all speakers of an
/// iteration.
const MIX_BUFFER_SAMPLES: usize = 23040;

/// How many past iterations feed the combined-audio gain average.
const GAIN_AVERAGE_WINDOW: usize = 16;

/// Per-user decryptors, shared between the session (which installs ratchets)
/// and the courier (which decrypts with them).
pub type DecryptorMap = HashMap<Snowflake, Arc<StdMutex<Decryptor>>>;

/// A control operation applied to a speaker's decoder before the next
/// decode.
#[derive(Debug, Clone, Copy)]
pub enum DecoderControl {
    /// `OPUS_SET_GAIN`, in Q8 dB units
    SetGain(i32),
}

/// A received, still encrypted RTP packet staged for decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkedPayload {
    pub seq: u16,
    pub timestamp: u32,
    /// The raw RTP packet as received
    pub packet: Vec<u8>,
}

// Min-heap on the sequence number
impl Ord for ParkedPayload {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.seq.cmp(&self.seq)
    }
}

impl PartialOrd for ParkedPayload {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Packets staged for one speaker, with the seq/timestamp window that is
/// currently deliverable.
#[derive(Debug, Default)]
pub struct ParkingLot {
    pub parked_payloads: BinaryHeap<ParkedPayload>,
    pub min_seq: u16,
    pub max_seq: u16,
    pub min_timestamp: u32,
    pub max_timestamp: u32,
    /// Created lazily on the first packet from this speaker
    pub decoder: Option<Arc<StdMutex<Decoder>>>,
    pub pending_decoder_ctls: Vec<DecoderControl>,
}

/// State shared between the UDP receive path and the courier task.
#[derive(Debug, Default)]
pub struct CourierSharedState {
    pub parked_voice_payloads: HashMap<Snowflake, ParkingLot>,
    pub terminating: bool,
}

/// Cloneable handle to the courier's shared state and wakeup signal.
#[derive(Debug, Clone, Default)]
pub struct CourierHandle {
    pub shared: Arc<StdMutex<CourierSharedState>>,
    pub notify: Arc<Notify>,
}

impl CourierHandle {
    pub fn new() -> CourierHandle {
        CourierHandle::default()
    }

    /// Wakes the courier and tells it to exit once all lots are drained.
    pub fn terminate(&self) {
        self.shared
            .lock()
            .expect("courier state mutex poisoned")
            .terminating = true;
        self.notify.notify_one();
    }
}

struct FlushData {
    user_id: Snowflake,
    min_seq: u16,
    parked_payloads: BinaryHeap<ParkedPayload>,
    pending_decoder_ctls: Vec<DecoderControl>,
    decoder: Option<Arc<StdMutex<Decoder>>>,
}

/// Tracks how many speakers were active recently, to scale the combined mix
/// back into 16 bit range without pumping.
#[derive(Debug, Default)]
struct MovingAverager {
    values: std::collections::VecDeque<i64>,
}

impl MovingAverager {
    fn push(&mut self, value: i64) {
        self.values.push_front(value);
        if self.values.len() >= GAIN_AVERAGE_WINDOW {
            self.values.pop_back();
        }
    }

    fn average(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        let sum: i64 = self.values.iter().sum();
        sum as f32 / self.values.len() as f32
    }
}

/// Spawns the courier task for one session.
pub(crate) fn spawn_courier(
    handle: CourierHandle,
    data: Arc<RwLock<VoiceData>>,
    decryptors: Arc<StdMutex<DecryptorMap>>,
    events: Arc<Mutex<VoiceClientEvents>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        courier_loop(handle, data, decryptors, events).await;
        trace!("VC: Courier task exited");
    })
}

async fn courier_loop(
    handle: CourierHandle,
    data: Arc<RwLock<VoiceData>>,
    decryptors: Arc<StdMutex<DecryptorMap>>,
    events: Arc<Mutex<VoiceClientEvents>>,
) {
    let mut averager = MovingAverager::default();
    let mut current_gain = 1.0f32;

    loop {
        // Transport the payloads onto this task and release the lock as
        // soon as possible
        let mut flush_data: Vec<FlushData> = Vec::new();
        {
            let mut shared = handle.shared.lock().expect("courier state mutex poisoned");

            flush_data.reserve(shared.parked_voice_payloads.len());
            let mut has_payload_to_deliver = false;

            for (user_id, parking_lot) in shared.parked_voice_payloads.iter_mut() {
                has_payload_to_deliver =
                    has_payload_to_deliver || !parking_lot.parked_payloads.is_empty();

                flush_data.push(FlushData {
                    user_id: *user_id,
                    min_seq: parking_lot.min_seq,
                    parked_payloads: std::mem::take(&mut parking_lot.parked_payloads),
                    // only take the pending ctls if a decoder exists to
                    // apply them to
                    pending_decoder_ctls: if parking_lot.decoder.is_some() {
                        std::mem::take(&mut parking_lot.pending_decoder_ctls)
                    } else {
                        Vec::new()
                    },
                    decoder: parking_lot.decoder.clone(),
                });

                parking_lot.min_seq = parking_lot.max_seq.wrapping_add(1);
                parking_lot.min_timestamp = parking_lot.max_timestamp.wrapping_add(1);
            }

            if !has_payload_to_deliver {
                if shared.terminating {
                    // Everything has been delivered, terminate now
                    break;
                }

                drop(shared);
                handle.notify.notified().await;
                continue;
            }
        }

        let (secret_key, dave_active) = {
            let data_lock = data.read().await;
            (data_lock.secret_key.clone(), data_lock.dave_version != 0)
        };
        let Some(secret_key) = secret_key else {
            // no key yet, nothing parked can be decrypted
            continue;
        };

        // This 32 bit PCM buffer is an upmixed version of the streams
        // combined for all users, so loud simultaneous speakers don't clip.
        let mut pcm_mix = vec![0i32; MIX_BUFFER_SAMPLES];
        let mut park_count: i64 = 0;
        let mut max_samples = 0usize;
        let mut samples = 0usize;

        for mut flush in flush_data {
            let Some(decoder_handle) = flush.decoder.take() else {
                continue;
            };

            // decoding happens synchronously under the decoder lock; events
            // are collected and published once the lock is released
            let mut speaker_events: Vec<VoiceReceiveEvent> = Vec::new();
            {
                let mut decoder = decoder_handle.lock().expect("decoder mutex poisoned");

                for ctl in flush.pending_decoder_ctls.drain(..) {
                    match ctl {
                        DecoderControl::SetGain(gain) => {
                            if let Err(e) = decoder.set_gain(gain) {
                                warn!("VC: Failed to set decoder gain: {e}");
                            }
                        }
                    }
                }

                let mut expected_seq = flush.min_seq;
                while let Some(next) = flush.parked_payloads.peek() {
                    if next.seq != expected_seq {
                        // Lost the packet with this sequence number, but the
                        // decoder can conceal the gap
                        if let Some(decoded) = decode_frame(&mut decoder, None) {
                            samples = decoded.len() / OPUS_CHANNEL_COUNT;
                            park_count =
                                mix_into(&mut pcm_mix, &decoded, park_count, &mut max_samples);
                            speaker_events.push(VoiceReceiveEvent {
                                user_id: flush.user_id,
                                ssrc: 0,
                                audio: decoded,
                            });
                        }
                        expected_seq = expected_seq.wrapping_add(1);
                        continue;
                    }

                    let payload = flush.parked_payloads.pop().expect("peeked above");
                    expected_seq = expected_seq.wrapping_add(1);

                    // Decryption happens here rather than on the socket
                    // task, so a slow courier never backs up the socket
                    let Ok(mut opus_packet) =
                        crypto::decrypt_rtp_packet(&secret_key, &payload.packet)
                    else {
                        trace!("VC: Dropping voice packet that failed transport decryption");
                        continue;
                    };

                    // With DAVE active, unwrap the frame with the speaker's
                    // per-user decryptor
                    if dave_active {
                        let decryptor = decryptors
                            .lock()
                            .expect("decryptor map mutex poisoned")
                            .get(&flush.user_id)
                            .cloned();
                        if let Some(decryptor) = decryptor {
                            let decrypted = decryptor
                                .lock()
                                .expect("decryptor mutex poisoned")
                                .decrypt(MediaType::Audio, &opus_packet);
                            match decrypted {
                                Some(frame) => opus_packet = frame,
                                None => {
                                    trace!(
                                        "VC: Dropping voice packet that failed frame decryption"
                                    );
                                    continue;
                                }
                            }
                        }
                    }

                    if let Some(decoded) = decode_frame(&mut decoder, Some(&opus_packet)) {
                        samples = decoded.len() / OPUS_CHANNEL_COUNT;
                        park_count = mix_into(&mut pcm_mix, &decoded, park_count, &mut max_samples);

                        let ssrc = BigEndian::read_u32(&payload.packet[8..12]);
                        speaker_events.push(VoiceReceiveEvent {
                            user_id: flush.user_id,
                            ssrc,
                            audio: decoded,
                        });
                    }
                }
            }

            let mut events_lock = events.lock().await;
            for event in speaker_events {
                events_lock.receive.publish(event).await;
            }
            drop(events_lock);
        }

        // If anything was mixed, dispatch the combined stream
        if park_count > 0 && samples > 0 {
            averager.push(park_count);
            let end_gain = 1.0 / averager.average().max(1.0);

            let total = max_samples * OPUS_CHANNEL_COUNT;
            let increment = (end_gain - current_gain) / samples as f32;
            let mut pcm_downsample = Vec::with_capacity(total);
            for (index, &wide) in pcm_mix[..total].iter().enumerate() {
                let gain = current_gain + increment * (index / OPUS_CHANNEL_COUNT) as f32;
                let scaled = (wide as f32 * gain).round();
                pcm_downsample.push(scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16);
            }
            current_gain = end_gain;

            events
                .lock()
                .await
                .receive_combined
                .publish(VoiceReceiveCombinedEvent {
                    audio: pcm_downsample,
                })
                .await;
        }
    }
}

/// Creates the decoder for a speaker's parking lot.
pub(crate) fn create_decoder() -> Option<Arc<StdMutex<Decoder>>> {
    match Decoder::new(SampleRate::Hz48000, Channels::Stereo) {
        Ok(decoder) => Some(Arc::new(StdMutex::new(decoder))),
        Err(e) => {
            error!("VC: Failed to create an opus decoder: {e}");
            None
        }
    }
}

/// Decodes one Opus packet ([None] runs packet loss concealment), returning
/// interleaved stereo PCM.
fn decode_frame(decoder: &mut Decoder, opus_packet: Option<&[u8]>) -> Option<Vec<i16>> {
    let mut output = vec![0i16; DECODE_BUFFER_SAMPLES];

    let packet = match opus_packet {
        Some(bytes) => Some(audiopus::packet::Packet::try_from(bytes).ok()?),
        None => None,
    };
    let signals = audiopus::MutSignals::try_from(&mut output[..]).ok()?;

    match decoder.decode(packet, signals, false) {
        Ok(samples) => {
            output.truncate(samples * OPUS_CHANNEL_COUNT);
            Some(output)
        }
        Err(e) => {
            trace!("VC: Opus decode failed: {e}");
            None
        }
    }
}

/// Adds one speaker's PCM into the wide accumulator. Returns the new count
/// of mixed streams.
fn mix_into(pcm_mix: &mut [i32], pcm: &[i16], park_count: i64, max_samples: &mut usize) -> i64 {
    let count = usize::min(pcm.len(), pcm_mix.len());
    for index in 0..count {
        pcm_mix[index] += i32::from(pcm[index]);
    }
    *max_samples = usize::max(*max_samples, count / OPUS_CHANNEL_COUNT);
    park_count + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parked_payloads_pop_in_seq_order() {
        let mut heap = BinaryHeap::new();
        for seq in [5u16, 3, 4, 7] {
            heap.push(ParkedPayload {
                seq,
                timestamp: u32::from(seq) * 960,
                packet: Vec::new(),
            });
        }

        let order: Vec<u16> = std::iter::from_fn(|| heap.pop().map(|p| p.seq)).collect();
        assert_eq!(order, vec![3, 4, 5, 7]);
    }

    #[test]
    fn mixing_accumulates_and_tracks_max() {
        let mut mix = vec![0i32; 8];
        let mut max_samples = 0;

        let count = mix_into(&mut mix, &[100, -100, 50, 50], 0, &mut max_samples);
        let count = mix_into(&mut mix, &[1, 1], count, &mut max_samples);

        assert_eq!(count, 2);
        assert_eq!(max_samples, 2);
        assert_eq!(&mix[..4], &[101, -99, 50, 50]);
    }

    #[test]
    fn moving_average() {
        let mut averager = MovingAverager::default();
        assert_eq!(averager.average(), 0.0);
        averager.push(2);
        averager.push(4);
        assert!((averager.average() - 3.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn courier_exits_on_terminate() {
        let handle = CourierHandle::new();
        let data = Arc::new(RwLock::new(VoiceData::default()));
        let decryptors = Arc::new(StdMutex::new(DecryptorMap::new()));
        let events = Arc::new(Mutex::new(VoiceClientEvents::default()));

        let task = spawn_courier(handle.clone(), data, decryptors, events);
        handle.terminate();

        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("courier did not exit")
            .unwrap();
    }
}
