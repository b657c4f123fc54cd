// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Opus encoding for the send pipeline.

use audiopus::coder::Encoder;
use audiopus::{Application, Channels, SampleRate};

use crate::errors::VoiceUdpError;

/// Opus runs at 48 kHz for voice connections.
pub const OPUS_SAMPLE_RATE_HZ: u32 = 48_000;

/// Voice connections are always stereo.
pub const OPUS_CHANNEL_COUNT: usize = 2;

/// Largest raw PCM input [VoiceHandler::send_audio_raw][raw] accepts in one
/// packet: 60 ms of 16 bit stereo samples. Larger inputs are split, smaller
/// ones zero padded.
///
/// [raw]: crate::voice::VoiceHandler::send_audio_raw
pub const SEND_AUDIO_RAW_MAX_LENGTH: usize = 11520;

/// Samples per channel in one maximum-size raw packet.
const SAMPLES_PER_PACKET: usize = SEND_AUDIO_RAW_MAX_LENGTH / OPUS_CHANNEL_COUNT / 2;

/// The stateful Opus encoder of one voice session.
#[derive(Debug)]
pub struct VoiceOpusEncoder {
    encoder: Encoder,
}

impl VoiceOpusEncoder {
    pub fn new() -> Result<VoiceOpusEncoder, VoiceUdpError> {
        let encoder = Encoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Voip)
            .map_err(|e| VoiceUdpError::OpusError {
                error: e.to_string(),
            })?;
        Ok(VoiceOpusEncoder { encoder })
    }

    /// Encodes exactly one 60 ms packet of 16 bit stereo PCM
    /// ([SEND_AUDIO_RAW_MAX_LENGTH] bytes, little endian).
    pub fn encode(&mut self, pcm_bytes: &[u8]) -> Result<Vec<u8>, VoiceUdpError> {
        if pcm_bytes.len() != SEND_AUDIO_RAW_MAX_LENGTH {
            return Err(VoiceUdpError::InvalidAudioLength);
        }

        let mut samples = vec![0i16; SAMPLES_PER_PACKET * OPUS_CHANNEL_COUNT];
        for (sample, bytes) in samples.iter_mut().zip(pcm_bytes.chunks_exact(2)) {
            *sample = i16::from_le_bytes([bytes[0], bytes[1]]);
        }

        let mut output = vec![0u8; 4096];
        let written = self
            .encoder
            .encode(&samples, &mut output)
            .map_err(|e| VoiceUdpError::OpusError {
                error: e.to_string(),
            })?;
        output.truncate(written);
        Ok(output)
    }
}

/// Duration of an Opus packet in milliseconds, from its table-of-contents
/// byte.
pub fn packet_duration_ms(opus_packet: &[u8]) -> Result<u64, VoiceUdpError> {
    let packet =
        audiopus::packet::Packet::try_from(opus_packet).map_err(|e| VoiceUdpError::OpusError {
            error: e.to_string(),
        })?;
    let samples = audiopus::packet::nb_samples(packet, SampleRate::Hz48000).map_err(|e| {
        VoiceUdpError::OpusError {
            error: e.to_string(),
        }
    })?;
    Ok(samples as u64 / 48)
}

/// Samples (per channel) an Opus packet of `duration_ms` advances the RTP
/// timestamp by.
pub fn timestamp_increment(duration_ms: u64) -> u32 {
    (duration_ms * 48) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dave::OPUS_SILENCE_PACKET;

    #[test]
    fn encodes_a_full_packet() {
        let mut encoder = VoiceOpusEncoder::new().unwrap();
        let silence = vec![0u8; SEND_AUDIO_RAW_MAX_LENGTH];
        let encoded = encoder.encode(&silence).unwrap();
        assert!(!encoded.is_empty());
        assert!(encoded.len() < SEND_AUDIO_RAW_MAX_LENGTH);
    }

    #[test]
    fn rejects_partial_packets() {
        let mut encoder = VoiceOpusEncoder::new().unwrap();
        assert_eq!(
            encoder.encode(&[0u8; 960]),
            Err(VoiceUdpError::InvalidAudioLength)
        );
    }

    #[test]
    fn silence_packet_duration() {
        // the canonical 3 byte silence frame is one 20 ms frame
        assert_eq!(packet_duration_ms(&OPUS_SILENCE_PACKET).unwrap(), 20);
    }

    #[test]
    fn timestamp_increments() {
        assert_eq!(timestamp_increment(20), 960);
        assert_eq!(timestamp_increment(60), 2880);
    }
}
