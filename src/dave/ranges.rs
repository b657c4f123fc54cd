// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Unencrypted byte ranges of a DAVE-encrypted media frame.
//!
//! A frame is split into regions the packetizer must be able to read in the
//! clear and regions that go through the AEAD. The ranges describe, at
//! plaintext frame positions, where the unencrypted bytes belong so that the
//! receiver can reassemble the frame.

use super::leb128::{leb128_size, read_leb128, write_leb128};

/// A single unencrypted region of a media frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnencryptedRange {
    pub offset: usize,
    pub size: usize,
}

pub type UnencryptedRanges = Vec<UnencryptedRange>;

/// Size in bytes of the serialized form of `ranges`.
pub fn unencrypted_ranges_size(ranges: &UnencryptedRanges) -> u8 {
    let mut size = 0;
    for range in ranges {
        size += leb128_size(range.offset as u64);
        size += leb128_size(range.size as u64);
    }
    size as u8
}

/// Serializes `ranges` as interleaved leb128 offset/size pairs.
pub fn serialize_unencrypted_ranges(ranges: &UnencryptedRanges, buffer: &mut Vec<u8>) -> u8 {
    let start = buffer.len();
    for range in ranges {
        write_leb128(range.offset as u64, buffer);
        write_leb128(range.size as u64, buffer);
    }
    (buffer.len() - start) as u8
}

/// Parses interleaved leb128 offset/size pairs until `buffer` is exhausted.
///
/// Returns [None] if the buffer does not contain a whole number of valid
/// pairs.
pub fn deserialize_unencrypted_ranges(buffer: &[u8]) -> Option<UnencryptedRanges> {
    let mut ranges = UnencryptedRanges::new();
    let mut at = 0;

    while at < buffer.len() {
        let (offset, read) = read_leb128(&buffer[at..])?;
        at += read;

        let (size, read) = read_leb128(&buffer[at..])?;
        at += read;

        ranges.push(UnencryptedRange {
            offset: offset as usize,
            size: size as usize,
        });
    }

    Some(ranges)
}

/// Validates that the ranges are in order, don't overlap, and fit within a
/// frame of `frame_size` bytes.
pub fn validate_unencrypted_ranges(ranges: &UnencryptedRanges, frame_size: usize) -> bool {
    if ranges.is_empty() {
        return true;
    }

    for i in 0..ranges.len() {
        let current = ranges[i];
        // The current range should not overflow into the next range
        // or, if it is the last range, past the end of the frame
        let max_end = if i + 1 < ranges.len() {
            ranges[i + 1].offset
        } else {
            frame_size
        };

        match current.offset.checked_add(current.size) {
            Some(end) if end <= max_end => {}
            _ => return false,
        }
    }

    true
}

/// Interleaves `range_bytes` and `other_bytes` back into frame order.
///
/// `range_bytes` land at the positions the ranges describe, `other_bytes`
/// fill the gaps in between and whatever remains after the last range.
/// Returns the number of bytes written to `output`.
pub fn reconstruct_frame(
    ranges: &UnencryptedRanges,
    range_bytes: &[u8],
    other_bytes: &[u8],
    output: &mut [u8],
) -> usize {
    let mut frame_index = 0;
    let mut range_bytes_index = 0;
    let mut other_bytes_index = 0;

    for range in ranges {
        if range.offset > frame_index {
            let size = range.offset - frame_index;
            output[frame_index..frame_index + size]
                .copy_from_slice(&other_bytes[other_bytes_index..other_bytes_index + size]);
            other_bytes_index += size;
            frame_index += size;
        }

        output[frame_index..frame_index + range.size]
            .copy_from_slice(&range_bytes[range_bytes_index..range_bytes_index + range.size]);
        range_bytes_index += range.size;
        frame_index += range.size;
    }

    if other_bytes_index < other_bytes.len() {
        let size = other_bytes.len() - other_bytes_index;
        output[frame_index..frame_index + size]
            .copy_from_slice(&other_bytes[other_bytes_index..]);
        frame_index += size;
    }

    frame_index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_roundtrip() {
        let ranges = vec![
            UnencryptedRange { offset: 0, size: 4 },
            UnencryptedRange {
                offset: 10,
                size: 300,
            },
            UnencryptedRange {
                offset: 1000,
                size: 1,
            },
        ];

        let mut buffer = Vec::new();
        let written = serialize_unencrypted_ranges(&ranges, &mut buffer);
        assert_eq!(written, unencrypted_ranges_size(&ranges));

        let parsed = deserialize_unencrypted_ranges(&buffer).unwrap();
        assert_eq!(parsed, ranges);
    }

    #[test]
    fn deserialize_rejects_partial_pair() {
        // one full pair, then an offset with no size
        let mut buffer = Vec::new();
        write_leb128(0, &mut buffer);
        write_leb128(4, &mut buffer);
        write_leb128(10, &mut buffer);
        assert_eq!(deserialize_unencrypted_ranges(&buffer), None);
    }

    #[test]
    fn validation() {
        let ok = vec![
            UnencryptedRange { offset: 0, size: 4 },
            UnencryptedRange { offset: 8, size: 2 },
        ];
        assert!(validate_unencrypted_ranges(&ok, 10));
        assert!(validate_unencrypted_ranges(&Vec::new(), 0));

        // overlapping
        let overlapping = vec![
            UnencryptedRange { offset: 0, size: 5 },
            UnencryptedRange { offset: 4, size: 2 },
        ];
        assert!(!validate_unencrypted_ranges(&overlapping, 10));

        // past the end of the frame
        let oversized = vec![UnencryptedRange { offset: 8, size: 4 }];
        assert!(!validate_unencrypted_ranges(&oversized, 10));

        // offset + size overflows
        let overflowing = vec![UnencryptedRange {
            offset: usize::MAX,
            size: 2,
        }];
        assert!(!validate_unencrypted_ranges(&overflowing, 10));
    }

    #[test]
    fn reconstruction() {
        let ranges = vec![
            UnencryptedRange { offset: 0, size: 2 },
            UnencryptedRange { offset: 5, size: 1 },
        ];
        let range_bytes = [0xaa, 0xbb, 0xcc];
        let other_bytes = [0x01, 0x02, 0x03, 0x04];

        let mut output = [0u8; 7];
        let written = reconstruct_frame(&ranges, &range_bytes, &other_bytes, &mut output);
        assert_eq!(written, 7);
        assert_eq!(output, [0xaa, 0xbb, 0x01, 0x02, 0x03, 0xcc, 0x04]);
    }
}
