// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Human-checkable verification codes derived from MLS key material.

use scrypt::Params;

/// Renders key material as a decimal code in groups of `group_size` digits,
/// the format users compare out-of-band to verify their call is not being
/// intercepted.
pub fn generate_displayable_code(data: &[u8], desired_length: usize, group_size: usize) -> String {
    if data.len() < desired_length {
        return String::new();
    }

    let group_modulus = 10u64.pow(group_size as u32);
    let mut result = String::new();

    let mut index = 0;
    while index < desired_length {
        let mut group_value: u64 = 0;

        for j in 0..group_size {
            let next_byte = u64::from(data[index + j]);
            group_value = (group_value << 8) | next_byte;
        }
        group_value %= group_modulus;

        if !result.is_empty() {
            result.push(' ');
        }
        result.push_str(&format!("{:0width$}", group_value, width = group_size));

        index += group_size;
    }

    result
}

/// The fixed salt for pairwise fingerprints.
const FINGERPRINT_SALT: [u8; 16] = [
    0x24, 0xca, 0xb1, 0x7a, 0x7a, 0xf8, 0xec, 0x2b, 0x82, 0xb4, 0x12, 0xb9, 0x2d, 0xab, 0x19,
    0x2e,
];

/// Derives the 64 byte pairwise fingerprint over both users' identity blobs.
///
/// Each blob is `version (2 bytes BE) || public signature key || user id
/// (8 bytes BE)`; the two blobs are sorted so the fingerprint is symmetric.
///
/// scrypt with these parameters costs tens of milliseconds and ~32 MiB, so
/// callers must run this off the hot path (see
/// [crate::dave::session::MlsSession::get_pairwise_fingerprint]).
pub fn pairwise_fingerprint(
    version: u16,
    local_key: &[u8],
    local_user_id: u64,
    remote_key: &[u8],
    remote_user_id: u64,
) -> Option<Vec<u8>> {
    let mut local = Vec::with_capacity(2 + local_key.len() + 8);
    local.extend_from_slice(&version.to_be_bytes());
    local.extend_from_slice(local_key);
    local.extend_from_slice(&local_user_id.to_be_bytes());

    let mut remote = Vec::with_capacity(2 + remote_key.len() + 8);
    remote.extend_from_slice(&version.to_be_bytes());
    remote.extend_from_slice(remote_key);
    remote.extend_from_slice(&remote_user_id.to_be_bytes());

    let mut blobs = [local, remote];
    blobs.sort();
    let mut password = blobs[0].clone();
    password.extend_from_slice(&blobs[1]);

    // N = 16384 (log2 = 14), r = 8, p = 2, 64 bytes out
    let params = Params::new(14, 8, 2, 64).ok()?;

    let mut out = vec![0u8; 64];
    scrypt::scrypt(&password, &FINGERPRINT_SALT, &params, &mut out).ok()?;
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displayable_code_format() {
        let data: Vec<u8> = (0u8..=255).collect();
        let code = generate_displayable_code(&data, 30, 5);

        let groups: Vec<&str> = code.split(' ').collect();
        assert_eq!(groups.len(), 6);
        for group in groups {
            assert_eq!(group.len(), 5);
            assert!(group.chars().all(|c| c.is_ascii_digit()));
        }

        // deterministic over the same data
        assert_eq!(code, generate_displayable_code(&data, 30, 5));
    }

    #[test]
    fn displayable_code_empty_input() {
        assert_eq!(generate_displayable_code(&[], 30, 5), "");
    }

    #[test]
    fn fingerprint_is_symmetric() {
        let key_a = [0x11u8; 32];
        let key_b = [0x22u8; 32];

        let ab = pairwise_fingerprint(0, &key_a, 100, &key_b, 200).unwrap();
        let ba = pairwise_fingerprint(0, &key_b, 200, &key_a, 100).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 64);
    }

    #[test]
    fn fingerprint_depends_on_identity() {
        let key_a = [0x11u8; 32];
        let key_b = [0x22u8; 32];

        let one = pairwise_fingerprint(0, &key_a, 100, &key_b, 200).unwrap();
        let other = pairwise_fingerprint(0, &key_a, 101, &key_b, 200).unwrap();
        assert_ne!(one, other);
    }
}
