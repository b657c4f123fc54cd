// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Splitting media frames into unencrypted and encrypted regions, and putting
//! them back together.

use log::*;

use super::codec_utils;
use super::leb128::read_leb128;
use super::ranges::{
    deserialize_unencrypted_ranges, reconstruct_frame, validate_unencrypted_ranges,
    UnencryptedRange, UnencryptedRanges,
};
use super::{
    Codec, AES_GCM_127_TRUNCATED_TAG_BYTES, MARKER_BYTES, SUPPLEMENTAL_BYTES,
};

/// Takes apart a received DAVE frame: supplemental trailer, authenticated
/// (unencrypted) bytes and ciphertext.
///
/// Instances are pooled by the decryptor to avoid per-packet allocation, so
/// all buffers are reused across [InboundFrameProcessor::parse_frame] calls.
#[derive(Debug, Default)]
pub struct InboundFrameProcessor {
    is_encrypted: bool,
    original_size: usize,
    truncated_nonce: u32,
    unencrypted_ranges: UnencryptedRanges,
    authenticated: Vec<u8>,
    ciphertext: Vec<u8>,
    plaintext: Vec<u8>,
    tag: [u8; AES_GCM_127_TRUNCATED_TAG_BYTES],
}

impl InboundFrameProcessor {
    pub fn new() -> InboundFrameProcessor {
        InboundFrameProcessor {
            truncated_nonce: u32::MAX,
            ..Default::default()
        }
    }

    pub fn clear(&mut self) {
        self.is_encrypted = false;
        self.original_size = 0;
        self.truncated_nonce = u32::MAX;
        self.unencrypted_ranges.clear();
        self.authenticated.clear();
        self.ciphertext.clear();
        self.plaintext.clear();
    }

    /// Parses `frame`; afterwards [InboundFrameProcessor::is_encrypted]
    /// tells whether this was a well-formed DAVE frame.
    pub fn parse_frame(&mut self, frame: &[u8]) {
        self.clear();

        const MIN_SUPPLEMENTAL_BYTES_SIZE: usize = SUPPLEMENTAL_BYTES;
        if frame.len() < MIN_SUPPLEMENTAL_BYTES_SIZE {
            warn!("DAVE: Encrypted frame is too small to contain min supplemental bytes");
            return;
        }

        // Check the frame ends with the magic marker
        if frame[frame.len() - MARKER_BYTES.len()..] != MARKER_BYTES {
            return;
        }

        // Read the supplemental bytes size
        let supplemental_bytes_size_index = frame.len() - MARKER_BYTES.len() - 1;
        let supplemental_bytes_size = frame[supplemental_bytes_size_index] as usize;

        // Check the frame is large enough to contain the supplemental bytes
        if frame.len() < supplemental_bytes_size {
            warn!("DAVE: Encrypted frame is too small to contain supplemental bytes");
            return;
        }

        // Check that the supplemental bytes size can cover its mandatory part
        if supplemental_bytes_size < MIN_SUPPLEMENTAL_BYTES_SIZE {
            warn!("DAVE: Supplemental bytes size is too small to contain supplemental bytes");
            return;
        }

        let supplemental_start = frame.len() - supplemental_bytes_size;

        // Read the tag
        self.tag
            .copy_from_slice(&frame[supplemental_start..supplemental_start + AES_GCM_127_TRUNCATED_TAG_BYTES]);

        // Read the nonce
        let nonce_start = supplemental_start + AES_GCM_127_TRUNCATED_TAG_BYTES;
        let nonce_buffer = &frame[nonce_start..supplemental_bytes_size_index];
        let Some((truncated_nonce, nonce_size)) = read_leb128(nonce_buffer) else {
            warn!("DAVE: Failed to read truncated nonce");
            return;
        };

        // Read the unencrypted ranges
        let ranges_buffer = &nonce_buffer[nonce_size..];
        let Some(unencrypted_ranges) = deserialize_unencrypted_ranges(ranges_buffer) else {
            warn!("DAVE: Failed to read unencrypted ranges");
            return;
        };

        if !validate_unencrypted_ranges(&unencrypted_ranges, frame.len()) {
            warn!("DAVE: Invalid unencrypted ranges");
            return;
        }

        self.truncated_nonce = truncated_nonce as u32;
        self.unencrypted_ranges = unencrypted_ranges;

        // This is overly aggressive but will keep reallocations to a minimum
        self.authenticated.reserve(frame.len());
        self.ciphertext.reserve(frame.len());
        self.plaintext.reserve(frame.len());

        self.original_size = frame.len();

        // Split the frame into authenticated and ciphertext bytes
        let mut frame_index = 0;
        for range in self.unencrypted_ranges.clone() {
            if range.offset > frame_index {
                self.ciphertext
                    .extend_from_slice(&frame[frame_index..range.offset]);
            }
            self.authenticated
                .extend_from_slice(&frame[range.offset..range.offset + range.size]);
            frame_index = range.offset + range.size;
        }
        let actual_frame_size = frame.len() - supplemental_bytes_size;
        if frame_index < actual_frame_size {
            self.ciphertext
                .extend_from_slice(&frame[frame_index..actual_frame_size]);
        }

        // Make sure the plaintext buffer is the same size as the ciphertext buffer
        self.plaintext.resize(self.ciphertext.len(), 0);

        // We've successfully parsed the frame
        self.is_encrypted = true;
    }

    pub fn is_encrypted(&self) -> bool {
        self.is_encrypted
    }

    pub fn tag(&self) -> &[u8] {
        &self.tag
    }

    pub fn truncated_nonce(&self) -> u32 {
        self.truncated_nonce
    }

    pub fn authenticated_data(&self) -> &[u8] {
        &self.authenticated
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn plaintext_mut(&mut self) -> &mut [u8] {
        &mut self.plaintext
    }

    /// Upper bound for the size of the reconstructed plaintext frame.
    pub fn plaintext_size(&self) -> usize {
        self.authenticated.len() + self.plaintext.len()
    }

    /// Writes the decrypted frame into `frame`, interleaving authenticated
    /// and decrypted bytes per the unencrypted ranges. Returns the number of
    /// bytes written.
    pub fn reconstruct_frame(&self, frame: &mut [u8]) -> usize {
        if !self.is_encrypted {
            warn!("DAVE: Cannot reconstruct an invalid encrypted frame");
            return 0;
        }

        if self.authenticated.len() + self.plaintext.len() > frame.len() {
            warn!("DAVE: Frame is too small to contain the decrypted frame");
            return 0;
        }

        reconstruct_frame(
            &self.unencrypted_ranges,
            &self.authenticated,
            &self.plaintext,
            frame,
        )
    }
}

/// Splits an outbound media frame into the bytes that stay in the clear and
/// the bytes that go through the AEAD, depending on the codec.
///
/// Instances are pooled by the encryptor.
#[derive(Debug, Default)]
pub struct OutboundFrameProcessor {
    codec: Codec,
    frame_index: usize,
    unencrypted_bytes: Vec<u8>,
    encrypted_bytes: Vec<u8>,
    ciphertext_bytes: Vec<u8>,
    unencrypted_ranges: UnencryptedRanges,
}

impl OutboundFrameProcessor {
    pub fn new() -> OutboundFrameProcessor {
        OutboundFrameProcessor::default()
    }

    pub fn reset(&mut self) {
        self.codec = Codec::Unknown;
        self.frame_index = 0;
        self.unencrypted_bytes.clear();
        self.encrypted_bytes.clear();
        self.unencrypted_ranges.clear();
    }

    /// Splits `frame` according to `codec`. A malformed video frame degrades
    /// to "encrypt everything" rather than failing the send.
    pub fn process_frame(&mut self, frame: &[u8], codec: Codec) {
        self.reset();

        self.codec = codec;
        self.unencrypted_bytes.reserve(frame.len());
        self.encrypted_bytes.reserve(frame.len());

        let success = match codec {
            Codec::Opus => codec_utils::process_frame_opus(self, frame),
            Codec::Vp8 => codec_utils::process_frame_vp8(self, frame),
            Codec::Vp9 => codec_utils::process_frame_vp9(self, frame),
            Codec::H264 => codec_utils::process_frame_h264(self, frame),
            Codec::H265 => codec_utils::process_frame_h265(self, frame),
            Codec::Av1 => codec_utils::process_frame_av1(self, frame),
            Codec::Unknown => false,
        };

        if !success {
            self.frame_index = 0;
            self.unencrypted_bytes.clear();
            self.encrypted_bytes.clear();
            self.unencrypted_ranges.clear();
            self.add_encrypted_bytes(frame);
        }

        self.ciphertext_bytes.resize(self.encrypted_bytes.len(), 0);
    }

    pub fn add_unencrypted_bytes(&mut self, bytes: &[u8]) {
        if let Some(last) = self.unencrypted_ranges.last_mut() {
            if last.offset + last.size == self.frame_index {
                // extend the last range
                last.size += bytes.len();
                self.unencrypted_bytes.extend_from_slice(bytes);
                self.frame_index += bytes.len();
                return;
            }
        }

        self.unencrypted_ranges.push(UnencryptedRange {
            offset: self.frame_index,
            size: bytes.len(),
        });
        self.unencrypted_bytes.extend_from_slice(bytes);
        self.frame_index += bytes.len();
    }

    pub fn add_encrypted_bytes(&mut self, bytes: &[u8]) {
        self.encrypted_bytes.extend_from_slice(bytes);
        self.frame_index += bytes.len();
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn unencrypted_bytes(&self) -> &[u8] {
        &self.unencrypted_bytes
    }

    pub fn encrypted_bytes(&self) -> &[u8] {
        &self.encrypted_bytes
    }

    pub fn ciphertext_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.ciphertext_bytes
    }

    pub fn unencrypted_ranges(&self) -> &UnencryptedRanges {
        &self.unencrypted_ranges
    }

    /// Size of the reassembled wire frame, before the supplemental trailer.
    pub fn reconstructed_size(&self) -> usize {
        self.unencrypted_bytes.len() + self.ciphertext_bytes.len()
    }

    /// Writes the wire frame (unencrypted bytes interleaved with ciphertext)
    /// into `frame`. Returns the number of bytes written.
    pub fn reconstruct_frame(&self, frame: &mut [u8]) -> usize {
        if self.unencrypted_bytes.len() + self.ciphertext_bytes.len() > frame.len() {
            warn!("DAVE: Frame is too small to contain the encrypted frame");
            return 0;
        }

        reconstruct_frame(
            &self.unencrypted_ranges,
            &self.unencrypted_bytes,
            &self.ciphertext_bytes,
            frame,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dave::leb128::write_leb128;
    use crate::dave::ranges::serialize_unencrypted_ranges;

    fn build_wire_frame(
        payload: &[u8],
        tag: &[u8; 8],
        nonce: u64,
        ranges: &UnencryptedRanges,
    ) -> Vec<u8> {
        let mut frame = payload.to_vec();
        frame.extend_from_slice(tag);
        let before = frame.len();
        write_leb128(nonce, &mut frame);
        serialize_unencrypted_ranges(ranges, &mut frame);
        let supplemental = SUPPLEMENTAL_BYTES + (frame.len() - before);
        frame.push(supplemental as u8);
        frame.extend_from_slice(&MARKER_BYTES);
        frame
    }

    #[test]
    fn outbound_ranges_merge_adjacent() {
        let mut processor = OutboundFrameProcessor::new();
        processor.add_unencrypted_bytes(&[1, 2]);
        processor.add_unencrypted_bytes(&[3]);
        processor.add_encrypted_bytes(&[4, 5]);
        processor.add_unencrypted_bytes(&[6]);

        assert_eq!(
            processor.unencrypted_ranges(),
            &vec![
                UnencryptedRange { offset: 0, size: 3 },
                UnencryptedRange { offset: 5, size: 1 },
            ]
        );
        assert_eq!(processor.unencrypted_bytes(), &[1, 2, 3, 6]);
        assert_eq!(processor.encrypted_bytes(), &[4, 5]);
    }

    #[test]
    fn inbound_rejects_missing_marker() {
        let mut processor = InboundFrameProcessor::new();
        processor.parse_frame(&[0u8; 32]);
        assert!(!processor.is_encrypted());
    }

    #[test]
    fn inbound_parses_opus_style_frame() {
        // fully encrypted payload, no unencrypted ranges
        let payload = [0xde, 0xad, 0xbe, 0xef];
        let tag = [7u8; 8];
        let frame = build_wire_frame(&payload, &tag, 1, &Vec::new());

        let mut processor = InboundFrameProcessor::new();
        processor.parse_frame(&frame);

        assert!(processor.is_encrypted());
        assert_eq!(processor.truncated_nonce(), 1);
        assert_eq!(processor.tag(), &tag);
        assert_eq!(processor.ciphertext(), &payload);
        assert!(processor.authenticated_data().is_empty());
    }

    #[test]
    fn inbound_splits_by_ranges() {
        // [2 clear][2 encrypted][1 clear] + trailer
        let payload = [0xaa, 0xbb, 0x01, 0x02, 0xcc];
        let tag = [0u8; 8];
        let ranges = vec![
            UnencryptedRange { offset: 0, size: 2 },
            UnencryptedRange { offset: 4, size: 1 },
        ];
        let frame = build_wire_frame(&payload, &tag, 0x7f, &ranges);

        let mut processor = InboundFrameProcessor::new();
        processor.parse_frame(&frame);

        assert!(processor.is_encrypted());
        assert_eq!(processor.authenticated_data(), &[0xaa, 0xbb, 0xcc]);
        assert_eq!(processor.ciphertext(), &[0x01, 0x02]);

        // pretend decryption is the identity and rebuild
        let ciphertext = processor.ciphertext().to_vec();
        processor.plaintext_mut().copy_from_slice(&ciphertext);
        let mut rebuilt = vec![0u8; processor.plaintext_size()];
        let written = processor.reconstruct_frame(&mut rebuilt);
        assert_eq!(written, payload.len());
        assert_eq!(&rebuilt[..written], &payload);
    }
}
