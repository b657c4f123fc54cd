// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Codec-specific rules for which bytes of a frame must stay unencrypted so
//! that WebRTC packetizers and depacketizers keep working.

use super::frame_processors::OutboundFrameProcessor;
use super::leb128::{read_leb128, write_leb128};
use super::Codec;

const NALU_LONG_START_CODE: [u8; 4] = [0, 0, 0, 1];
const NALU_SHORT_START_SEQUENCE_SIZE: usize = 3;

/// Counts the payload bytes covering the first three exponential-Golomb
/// encoded values of an H.264 slice header (first_mb_in_slice, sps_id,
/// pps_id). The depacketizer needs the pps_id unencrypted, and the payload
/// has RBSP emulation prevention bytes we need to skip over.
///
/// Returns [None] for unreasonably large exp-Golomb values (malformed data).
fn bytes_covering_h264_pps(payload: &[u8], size_remaining: usize) -> Option<u16> {
    const EMULATION_PREVENTION_BYTE: u8 = 0x03;

    let mut payload_bit_index: usize = 0;
    let mut zero_bit_count = 0;
    let mut parsed_exp_golomb_values = 0;

    while payload_bit_index < size_remaining * 8 && parsed_exp_golomb_values < 3 {
        let bit_index = payload_bit_index % 8;
        let byte_index = payload_bit_index / 8;
        let payload_byte = payload[byte_index];

        // if we're starting a new byte, check if this is an emulation
        // prevention byte, which we skip over
        if bit_index == 0
            && byte_index >= 2
            && payload_byte == EMULATION_PREVENTION_BYTE
            && payload[byte_index - 1] == 0
            && payload[byte_index - 2] == 0
        {
            payload_bit_index += 8;
            continue;
        }

        if payload_byte & (1 << (7 - bit_index)) == 0 {
            // still in the run of leading zero bits
            zero_bit_count += 1;
            payload_bit_index += 1;

            if zero_bit_count >= 32 {
                return None;
            }
        } else {
            // we hit a one, skip forward the number of bits dictated by the
            // leading number of zeroes
            parsed_exp_golomb_values += 1;
            payload_bit_index += 1 + zero_bit_count;
            zero_bit_count = 0;
        }
    }

    // the number of bytes that covers the last exp golomb encoded value
    u16::try_from(payload_bit_index / 8 + 1).ok()
}

/// Finds the next 3 or 4 byte NAL unit start code at or after
/// `search_start_index`. Returns the index of the NAL unit (just past the
/// start code) and the start code's size.
pub(super) fn next_h26x_nalu_index(
    buffer: &[u8],
    search_start_index: usize,
) -> Option<(usize, usize)> {
    const START_CODE_HIGHEST_POSSIBLE_VALUE: u8 = 1;
    const START_CODE_END_BYTE_VALUE: u8 = 1;
    const START_CODE_LEADING_BYTES_VALUE: u8 = 0;

    if buffer.len() < NALU_SHORT_START_SEQUENCE_SIZE {
        return None;
    }

    let mut i = search_start_index;
    while i < buffer.len() - NALU_SHORT_START_SEQUENCE_SIZE {
        if buffer[i + 2] > START_CODE_HIGHEST_POSSIBLE_VALUE {
            // third byte is not 0 or 1, can't be a start code
            i += NALU_SHORT_START_SEQUENCE_SIZE;
        } else if buffer[i + 2] == START_CODE_END_BYTE_VALUE {
            // third byte matches the start code end byte, might be a start code sequence
            if buffer[i + 1] == START_CODE_LEADING_BYTES_VALUE
                && buffer[i] == START_CODE_LEADING_BYTES_VALUE
            {
                // confirmed start sequence {0, 0, 1}
                let nal_unit_start_index = i + NALU_SHORT_START_SEQUENCE_SIZE;

                if i >= 1 && buffer[i - 1] == START_CODE_LEADING_BYTES_VALUE {
                    return Some((nal_unit_start_index, 4));
                } else {
                    return Some((nal_unit_start_index, 3));
                }
            }

            i += NALU_SHORT_START_SEQUENCE_SIZE;
        } else {
            // third byte is 0, might be a four byte start code
            i += 1;
        }
    }

    None
}

pub(super) fn process_frame_opus(processor: &mut OutboundFrameProcessor, frame: &[u8]) -> bool {
    processor.add_encrypted_bytes(frame);
    true
}

pub(super) fn process_frame_vp8(processor: &mut OutboundFrameProcessor, frame: &[u8]) -> bool {
    const KEY_FRAME_UNENCRYPTED_BYTES: usize = 10;
    const DELTA_FRAME_UNENCRYPTED_BYTES: usize = 1;

    // parse the VP8 payload header to determine if it's a key frame
    // https://datatracker.ietf.org/doc/html/rfc7741#section-4.3

    // 0 1 2 3 4 5 6 7
    // +-+-+-+-+-+-+-+-+
    // |Size0|H| VER |P|
    // +-+-+-+-+-+-+-+-+
    // P is an inverse key frame flag

    // if this is a key frame the depacketizer will read 10 bytes into the payload header
    // if this is a delta frame the depacketizer only needs the first byte of the payload
    // header (since that's where the key frame flag is)

    if frame.is_empty() {
        return false;
    }

    let unencrypted_header_bytes = if frame[0] & 0x01 == 0 {
        KEY_FRAME_UNENCRYPTED_BYTES
    } else {
        DELTA_FRAME_UNENCRYPTED_BYTES
    };

    if frame.len() < unencrypted_header_bytes {
        return false;
    }

    processor.add_unencrypted_bytes(&frame[..unencrypted_header_bytes]);
    processor.add_encrypted_bytes(&frame[unencrypted_header_bytes..]);
    true
}

pub(super) fn process_frame_vp9(processor: &mut OutboundFrameProcessor, frame: &[u8]) -> bool {
    // payload descriptor is unencrypted in each packet
    // and includes all information the depacketizer needs
    processor.add_encrypted_bytes(frame);
    true
}

pub(super) fn process_frame_h264(processor: &mut OutboundFrameProcessor, frame: &[u8]) -> bool {
    // minimize the amount of unencrypted header data for H264 depending on
    // the NAL unit type, mirroring what the WebRTC packetizer reads
    const NAL_HEADER_TYPE_MASK: u8 = 0x1f;
    const NAL_TYPE_SLICE: u8 = 1;
    const NAL_TYPE_IDR: u8 = 5;
    const NAL_UNIT_HEADER_SIZE: usize = 1;

    // this frame can be packetized as a STAP-A or a FU-A
    // so we need to look at the first NAL units to determine how many bytes
    // the packetizer/depacketizer will need into the payload
    if frame.len() < NALU_SHORT_START_SEQUENCE_SIZE + NAL_UNIT_HEADER_SIZE {
        return false;
    }

    let mut nalu_index_pair = next_h26x_nalu_index(frame, 0);
    while let Some((nal_unit_start_index, _start_code_size)) = nalu_index_pair {
        if nal_unit_start_index >= frame.len() - 1 {
            break;
        }

        let nal_type = frame[nal_unit_start_index] & NAL_HEADER_TYPE_MASK;

        // Because WebRTC will convert all start codes to 4-byte on the
        // receiver side, always write a long start code and then the NAL unit
        processor.add_unencrypted_bytes(&NALU_LONG_START_CODE);

        let next_nalu_index_pair = next_h26x_nalu_index(frame, nal_unit_start_index);
        let next_nalu_start = next_nalu_index_pair
            .map(|(index, start_code_size)| index - start_code_size)
            .unwrap_or(frame.len());

        if nal_type == NAL_TYPE_SLICE || nal_type == NAL_TYPE_IDR {
            // once we've hit a slice or an IDR
            // we just need to cover getting to the PPS ID
            let nal_unit_payload_start = nal_unit_start_index + NAL_UNIT_HEADER_SIZE;
            let Some(nal_unit_pps_bytes) = bytes_covering_h264_pps(
                &frame[nal_unit_payload_start..],
                frame.len() - nal_unit_payload_start,
            ) else {
                return false;
            };
            let nal_unit_pps_bytes = nal_unit_pps_bytes as usize;

            let unencrypted_end =
                nal_unit_start_index + NAL_UNIT_HEADER_SIZE + nal_unit_pps_bytes;
            if unencrypted_end > next_nalu_start {
                return false;
            }

            processor.add_unencrypted_bytes(&frame[nal_unit_start_index..unencrypted_end]);
            processor.add_encrypted_bytes(&frame[unencrypted_end..next_nalu_start]);
        } else {
            // copy the whole NAL unit
            processor.add_unencrypted_bytes(&frame[nal_unit_start_index..next_nalu_start]);
        }

        nalu_index_pair = next_nalu_index_pair;
    }

    true
}

pub(super) fn process_frame_h265(processor: &mut OutboundFrameProcessor, frame: &[u8]) -> bool {
    const NAL_HEADER_TYPE_MASK: u8 = 0x7e;
    const NAL_TYPE_VCL_CUTOFF: u8 = 32;
    const NAL_UNIT_HEADER_SIZE: usize = 2;

    if frame.len() < NALU_SHORT_START_SEQUENCE_SIZE + NAL_UNIT_HEADER_SIZE {
        return false;
    }

    // look for NAL unit 3 or 4 byte start code
    let mut nalu_index_pair = next_h26x_nalu_index(frame, 0);
    while let Some((nal_unit_start_index, _start_code_size)) = nalu_index_pair {
        if nal_unit_start_index >= frame.len() - 1 {
            break;
        }

        let nal_type = (frame[nal_unit_start_index] & NAL_HEADER_TYPE_MASK) >> 1;

        // Because WebRTC will convert all start codes to 4-byte on the
        // receiver side, always write a long start code and then the NAL unit
        processor.add_unencrypted_bytes(&NALU_LONG_START_CODE);

        let next_nalu_index_pair = next_h26x_nalu_index(frame, nal_unit_start_index);
        let next_nalu_start = next_nalu_index_pair
            .map(|(index, start_code_size)| index - start_code_size)
            .unwrap_or(frame.len());

        if nal_type < NAL_TYPE_VCL_CUTOFF {
            // found a VCL NAL, encrypt the payload only
            let header_end = nal_unit_start_index + NAL_UNIT_HEADER_SIZE;
            if header_end > next_nalu_start {
                return false;
            }
            processor.add_unencrypted_bytes(&frame[nal_unit_start_index..header_end]);
            processor.add_encrypted_bytes(&frame[header_end..next_nalu_start]);
        } else {
            // copy the whole NAL unit
            processor.add_unencrypted_bytes(&frame[nal_unit_start_index..next_nalu_start]);
        }

        nalu_index_pair = next_nalu_index_pair;
    }

    true
}

pub(super) fn process_frame_av1(processor: &mut OutboundFrameProcessor, frame: &[u8]) -> bool {
    const OBU_HEADER_HAS_EXTENSION_MASK: u8 = 0b0_0000_100;
    const OBU_HEADER_HAS_SIZE_MASK: u8 = 0b0_0000_010;
    const OBU_HEADER_TYPE_MASK: u8 = 0b0_1111_000;
    const OBU_TYPE_TEMPORAL_DELIMITER: u8 = 2;
    const OBU_TYPE_TILE_LIST: u8 = 8;
    const OBU_TYPE_PADDING: u8 = 15;
    const OBU_EXTENSION_SIZE_BYTES: usize = 1;

    let mut i = 0;
    while i < frame.len() {
        // Read the OBU header.
        let obu_header_index = i;
        let mut obu_header = frame[obu_header_index];
        i += 1;

        let obu_has_extension = obu_header & OBU_HEADER_HAS_EXTENSION_MASK != 0;
        let obu_has_size = obu_header & OBU_HEADER_HAS_SIZE_MASK != 0;
        let obu_type = (obu_header & OBU_HEADER_TYPE_MASK) >> 3;

        if obu_has_extension {
            // Skip extension byte
            i += OBU_EXTENSION_SIZE_BYTES;
        }

        if i >= frame.len() {
            // Malformed frame: header overflows frame
            return false;
        }

        let obu_payload_size = if obu_has_size {
            // Read payload size
            let Some((size, read)) = read_leb128(&frame[i..]) else {
                // Malformed frame: invalid LEB128 size
                return false;
            };
            i += read;
            size as usize
        } else {
            // If the size is not present, the OBU extends to the end of the frame.
            frame.len() - i
        };

        let obu_payload_index = i;

        if i + obu_payload_size > frame.len() {
            // Malformed frame: payload overflows frame
            return false;
        }

        i += obu_payload_size;

        // We only copy the OBUs that will not get dropped by the packetizer
        if obu_type != OBU_TYPE_TEMPORAL_DELIMITER
            && obu_type != OBU_TYPE_TILE_LIST
            && obu_type != OBU_TYPE_PADDING
        {
            // if this is the last OBU, we may need to flip the "has size" bit
            // which allows us to append necessary protocol data to the frame
            let mut rewritten_without_size = false;

            if i == frame.len() && obu_has_size {
                // Flip the "has size" bit
                obu_header &= !OBU_HEADER_HAS_SIZE_MASK;
                rewritten_without_size = true;
            }

            // write the OBU header unencrypted
            processor.add_unencrypted_bytes(&[obu_header]);
            if obu_has_extension {
                // write the extension byte unencrypted
                processor.add_unencrypted_bytes(
                    &frame[obu_header_index + 1..obu_header_index + 1 + OBU_EXTENSION_SIZE_BYTES],
                );
            }

            // write the OBU payload size unencrypted if it was present and we
            // didn't rewrite without it
            if obu_has_size && !rewritten_without_size {
                // The AMD AV1 encoder may pad LEB128 encoded sizes with a
                // zero byte which the webrtc packetizer removes. To prevent
                // the packetizer from changing the frame, we sanitize the
                // size by re-writing it ourselves
                let mut leb128_buffer = Vec::new();
                write_leb128(obu_payload_size as u64, &mut leb128_buffer);
                processor.add_unencrypted_bytes(&leb128_buffer);
            }

            // add the OBU payload, encrypted
            processor.add_encrypted_bytes(&frame[obu_payload_index..obu_payload_index + obu_payload_size]);
        }
    }

    true
}

/// Checks a reassembled H.264/H.265 wire frame for accidental NAL start
/// codes bridging the boundaries between encrypted and unencrypted sections.
/// Other codecs always validate.
pub(super) fn validate_encrypted_frame(
    processor: &OutboundFrameProcessor,
    frame: &[u8],
) -> bool {
    let codec = processor.codec();
    if codec != Codec::H264 && codec != Codec::H265 {
        return true;
    }

    const PADDING: usize = NALU_SHORT_START_SEQUENCE_SIZE - 1;

    let unencrypted_ranges = processor.unencrypted_ranges();

    // H264 and H265 ciphertexts cannot contain a 3 or 4 byte start code
    // {0, 0, 1}, otherwise the packetizer gets confused and the frame we get
    // on the decryption side will be shifted and fail to decrypt
    let mut encrypted_section_start = 0;
    for range in unencrypted_ranges {
        if encrypted_section_start == range.offset {
            encrypted_section_start += range.size;
            continue;
        }

        let start = encrypted_section_start - usize::min(encrypted_section_start, PADDING);
        let end = usize::min(range.offset + PADDING, frame.len());
        if next_h26x_nalu_index(&frame[start..end], 0).is_some() {
            return false;
        }

        encrypted_section_start = range.offset + range.size;
    }

    if encrypted_section_start == frame.len() {
        return true;
    }

    let start = encrypted_section_start - usize::min(encrypted_section_start, PADDING);
    if next_h26x_nalu_index(&frame[start..], 0).is_some() {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dave::frame_processors::OutboundFrameProcessor;
    use crate::dave::ranges::UnencryptedRange;

    #[test]
    fn nalu_index_finds_short_and_long_start_codes() {
        let buffer = [0xab, 0x00, 0x00, 0x01, 0x65, 0x00, 0x00, 0x00, 0x01, 0x41, 0xff];
        let (index, size) = next_h26x_nalu_index(&buffer, 0).unwrap();
        assert_eq!((index, size), (4, 3));

        let (index, size) = next_h26x_nalu_index(&buffer, index).unwrap();
        assert_eq!((index, size), (9, 4));

        assert_eq!(next_h26x_nalu_index(&buffer, index), None);
    }

    #[test]
    fn nalu_index_ignores_non_start_codes() {
        let buffer = [0x00, 0x01, 0x02, 0x00, 0x01, 0x02, 0x00, 0x01];
        assert_eq!(next_h26x_nalu_index(&buffer, 0), None);
    }

    #[test]
    fn vp8_key_frame_header_stays_clear() {
        // low bit of the first byte unset = key frame, 10 bytes unencrypted
        let frame: Vec<u8> = (0u8..20).map(|b| b << 1).collect();
        let mut processor = OutboundFrameProcessor::new();
        processor.process_frame(&frame, Codec::Vp8);

        assert_eq!(
            processor.unencrypted_ranges(),
            &vec![UnencryptedRange { offset: 0, size: 10 }]
        );
        assert_eq!(processor.encrypted_bytes(), &frame[10..]);
    }

    #[test]
    fn vp8_delta_frame_keeps_one_byte() {
        let mut frame = vec![0u8; 20];
        frame[0] = 0x01;
        let mut processor = OutboundFrameProcessor::new();
        processor.process_frame(&frame, Codec::Vp8);

        assert_eq!(
            processor.unencrypted_ranges(),
            &vec![UnencryptedRange { offset: 0, size: 1 }]
        );
    }

    #[test]
    fn opus_and_vp9_fully_encrypted() {
        for codec in [Codec::Opus, Codec::Vp9] {
            let frame = [1u8, 2, 3, 4];
            let mut processor = OutboundFrameProcessor::new();
            processor.process_frame(&frame, codec);
            assert!(processor.unencrypted_ranges().is_empty());
            assert_eq!(processor.encrypted_bytes(), &frame);
        }
    }

    #[test]
    fn h264_slice_keeps_start_code_header_and_pps() {
        // 4-byte start code, IDR NAL (type 5), then a payload whose first
        // three exp-Golomb values are all `1` bits (one byte covers them)
        let frame = [
            0x00, 0x00, 0x00, 0x01, // start code
            0x65, // NAL header, type 5 (IDR)
            0xe0, // 111..... three one-bit exp-Golomb values
            0xde, 0xad, 0xbe, 0xef, // slice payload
        ];
        let mut processor = OutboundFrameProcessor::new();
        processor.process_frame(&frame, Codec::H264);

        // long start code + NAL header + 1 PPS byte unencrypted
        assert_eq!(
            processor.unencrypted_ranges(),
            &vec![UnencryptedRange { offset: 0, size: 6 }]
        );
        assert_eq!(
            processor.unencrypted_bytes(),
            &[0x00, 0x00, 0x00, 0x01, 0x65, 0xe0]
        );
        assert_eq!(processor.encrypted_bytes(), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn h264_non_slice_nal_fully_unencrypted() {
        // SPS NAL (type 7) is not a slice, remains fully in the clear
        let frame = [0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1f];
        let mut processor = OutboundFrameProcessor::new();
        processor.process_frame(&frame, Codec::H264);

        assert!(processor.encrypted_bytes().is_empty());
        // 3-byte start code is normalized to 4 bytes
        assert_eq!(
            processor.unencrypted_bytes(),
            &[0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1f]
        );
    }

    #[test]
    fn h265_vcl_nal_header_stays_clear() {
        // NAL type 1 (< 32, VCL), 2 byte header
        let frame = [0x00, 0x00, 0x01, 0x02, 0x01, 0xaa, 0xbb, 0xcc];
        let mut processor = OutboundFrameProcessor::new();
        processor.process_frame(&frame, Codec::H265);

        assert_eq!(
            processor.unencrypted_bytes(),
            &[0x00, 0x00, 0x00, 0x01, 0x02, 0x01]
        );
        assert_eq!(processor.encrypted_bytes(), &[0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn av1_skips_temporal_delimiter_and_clears_size_bit() {
        let frame = [
            0x12, 0x00, // temporal delimiter OBU (type 2, has size, size 0)
            0x32, 0x03, 0x0a, 0x0b, 0x0c, // frame OBU (type 6, has size, size 3)
        ];
        let mut processor = OutboundFrameProcessor::new();
        processor.process_frame(&frame, Codec::Av1);

        // temporal delimiter dropped; the last OBU's header is rewritten
        // without the size field
        assert_eq!(processor.unencrypted_bytes(), &[0x30]);
        assert_eq!(processor.encrypted_bytes(), &[0x0a, 0x0b, 0x0c]);
    }

    #[test]
    fn av1_keeps_sanitized_size_for_intermediate_obus() {
        let frame = [
            0x32, 0x01, 0xaa, // frame OBU with size 1
            0x32, 0x02, 0xbb, 0xcc, // trailing frame OBU with size 2
        ];
        let mut processor = OutboundFrameProcessor::new();
        processor.process_frame(&frame, Codec::Av1);

        // first OBU keeps header + size byte; second is rewritten sizeless
        assert_eq!(processor.unencrypted_bytes(), &[0x32, 0x01, 0x30]);
        assert_eq!(processor.encrypted_bytes(), &[0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn malformed_av1_degrades_to_fully_encrypted() {
        // has_size flag set but the size overflows the frame
        let frame = [0x32, 0x7f, 0x01];
        let mut processor = OutboundFrameProcessor::new();
        processor.process_frame(&frame, Codec::Av1);

        assert!(processor.unencrypted_ranges().is_empty());
        assert_eq!(processor.encrypted_bytes(), &frame);
    }

    #[test]
    fn validation_flags_start_code_across_boundary() {
        // IDR slice: unencrypted [0, 6), encrypted [6, 10)
        let frame = [
            0x00, 0x00, 0x00, 0x01, 0x65, 0xe0, 0xde, 0xad, 0xbe, 0xef,
        ];
        let mut processor = OutboundFrameProcessor::new();
        processor.process_frame(&frame, Codec::H264);

        // a reassembled frame whose ciphertext begins with a start code
        // bridging the boundary
        let bad_frame = [
            0x00, 0x00, 0x00, 0x01, 0x65, 0x00, 0x00, 0x01, 0xbe, 0xef,
        ];
        assert!(!validate_encrypted_frame(&processor, &bad_frame));

        let good_frame = [
            0x00, 0x00, 0x00, 0x01, 0x65, 0xe0, 0xaa, 0xbb, 0xcc, 0xdd,
        ];
        assert!(validate_encrypted_frame(&processor, &good_frame));

        // opus frames never fail validation
        let mut opus = OutboundFrameProcessor::new();
        opus.process_frame(&[0x00, 0x00, 0x01], Codec::Opus);
        assert!(validate_encrypted_frame(&opus, &[0x00, 0x00, 0x01]));
    }
}
