// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Transport encryption (`aead_xchacha20_poly1305_rtpsize`) for the voice
//! UDP connection.
//!
//! Every RTP payload is sealed with XChaCha20-Poly1305; the AAD is the
//! unencrypted part of the RTP packet and the nonce is a 32 bit counter that
//! travels truncated at the end of the packet.
//!
//! See <https://discord.com/developers/docs/topics/voice-connections#transport-encryption-and-sending-voice>

use byteorder::{BigEndian, ByteOrder};

use crate::dave::cipher::{AeadCipher, XChaCha20Poly1305Cipher};
use crate::errors::VoiceUdpError;

use super::udp::RTP_HEADER_SIZE;

/// Size of the Poly1305 tag trailing the ciphertext.
pub(crate) const TAG_SIZE: usize = 16;

/// Size of the truncated nonce trailing the packet.
pub(crate) const NONCE_SUFFIX_SIZE: usize = 4;

/// Builds the constant-prefix RTP header (version 2, payload type 120).
pub(crate) fn build_rtp_header(sequence: u16, timestamp: u32, ssrc: u32) -> [u8; RTP_HEADER_SIZE] {
    let mut header = [0u8; RTP_HEADER_SIZE];
    header[0] = 0x80;
    header[1] = 0x78;
    BigEndian::write_u16(&mut header[2..4], sequence);
    BigEndian::write_u32(&mut header[4..8], timestamp);
    BigEndian::write_u32(&mut header[8..12], ssrc);
    header
}

/// Expands the truncated 32 bit packet nonce into the 24 byte XChaCha nonce:
/// the counter big-endian at offset 0, zero padded.
pub(crate) fn get_xchacha20_poly1305_rtpsize_nonce(packet_nonce: u32) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    BigEndian::write_u32(&mut nonce[..NONCE_SUFFIX_SIZE], packet_nonce);
    nonce
}

/// Encrypts one payload into a complete RTP packet:
///
/// `[12 byte header][ciphertext][16 byte tag][4 byte truncated nonce]`
pub(crate) fn encrypt_rtp_packet(
    secret_key: &[u8; 32],
    packet_nonce: u32,
    header: &[u8; RTP_HEADER_SIZE],
    payload: &[u8],
) -> Result<Vec<u8>, VoiceUdpError> {
    let nonce = get_xchacha20_poly1305_rtpsize_nonce(packet_nonce);
    let cipher = XChaCha20Poly1305Cipher::new(secret_key);

    let mut packet = vec![0u8; RTP_HEADER_SIZE + payload.len() + TAG_SIZE + NONCE_SUFFIX_SIZE];
    packet[..RTP_HEADER_SIZE].copy_from_slice(header);

    let (ciphertext, trailer) =
        packet[RTP_HEADER_SIZE..].split_at_mut(payload.len());
    let (tag, nonce_suffix) = trailer.split_at_mut(TAG_SIZE);

    if !cipher.encrypt(ciphertext, payload, &nonce, header, tag) {
        return Err(VoiceUdpError::FailedEncryption);
    }

    nonce_suffix.copy_from_slice(&nonce[..NONCE_SUFFIX_SIZE]);

    Ok(packet)
}

/// Decrypts a received RTP packet, returning the payload with any RTP header
/// extension stripped.
///
/// The AAD covers the fixed header, the CSRC list and (when the extension
/// bit is set) the 4 byte extension header; the extension body itself is
/// encrypted together with the media payload and skipped after decryption.
pub(crate) fn decrypt_rtp_packet(
    secret_key: &[u8; 32],
    packet: &[u8],
) -> Result<Vec<u8>, VoiceUdpError> {
    if packet.len() < RTP_HEADER_SIZE + TAG_SIZE + NONCE_SUFFIX_SIZE {
        return Err(VoiceUdpError::FailedDecryption);
    }

    // the truncated nonce is the last 4 bytes, zero padded to 24
    let nonce_suffix = &packet[packet.len() - NONCE_SUFFIX_SIZE..];
    let mut nonce = [0u8; 24];
    nonce[..NONCE_SUFFIX_SIZE].copy_from_slice(nonce_suffix);

    let csrc_count = (packet[0] & 0x0f) as usize;
    let uses_extension = packet[0] & 0x10 != 0;

    let mut header_len = RTP_HEADER_SIZE + 4 * csrc_count;

    // the extension body is encrypted, only its 4 byte header (profile +
    // length) is part of the unencrypted prefix
    let mut extension_len = 0;
    if uses_extension {
        if packet.len() < header_len + 4 {
            return Err(VoiceUdpError::FailedDecryption);
        }
        let extension_words = BigEndian::read_u16(&packet[header_len + 2..header_len + 4]);
        extension_len = 4 * extension_words as usize;
        header_len += 4;
    }

    if packet.len() < header_len + TAG_SIZE + NONCE_SUFFIX_SIZE {
        return Err(VoiceUdpError::FailedDecryption);
    }

    let additional_data = &packet[..header_len];
    let ciphertext_and_tag = &packet[header_len..packet.len() - NONCE_SUFFIX_SIZE];
    let (ciphertext, tag) = ciphertext_and_tag.split_at(ciphertext_and_tag.len() - TAG_SIZE);

    let cipher = XChaCha20Poly1305Cipher::new(secret_key);
    let mut plaintext = vec![0u8; ciphertext.len()];
    if !cipher.decrypt(&mut plaintext, ciphertext, tag, &nonce, additional_data) {
        return Err(VoiceUdpError::FailedDecryption);
    }

    if extension_len > 0 {
        if extension_len > plaintext.len() {
            return Err(VoiceUdpError::FailedDecryption);
        }
        // skip the previously encrypted RTP header extension
        plaintext.drain(..extension_len);
    }

    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtp_header_layout() {
        let header = build_rtp_header(0, 0, 1234);
        assert_eq!(
            header,
            [0x80, 0x78, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0xd2]
        );
    }

    #[test]
    fn nonce_expansion() {
        let nonce = get_xchacha20_poly1305_rtpsize_nonce(1);
        let mut expected = [0u8; 24];
        expected[3] = 1;
        assert_eq!(nonce, expected);

        // extracting the truncated bytes and re-padding yields the same nonce
        let truncated = BigEndian::read_u32(&nonce[..4]);
        assert_eq!(get_xchacha20_poly1305_rtpsize_nonce(truncated), nonce);
    }

    #[test]
    fn packet_roundtrip() {
        let secret_key = [0u8; 32];
        let header = build_rtp_header(0, 0, 1234);
        let payload = [0xf8, 0xff, 0xfe];

        let packet = encrypt_rtp_packet(&secret_key, 1, &header, &payload).unwrap();

        assert_eq!(packet.len(), RTP_HEADER_SIZE + payload.len() + TAG_SIZE + 4);
        assert_eq!(&packet[..RTP_HEADER_SIZE], &header);
        // truncated nonce 1, big endian, at the very end
        assert_eq!(&packet[packet.len() - 4..], &[0x00, 0x00, 0x00, 0x01]);

        let decrypted = decrypt_rtp_packet(&secret_key, &packet).unwrap();
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn tampered_packet_fails() {
        let secret_key = [7u8; 32];
        let header = build_rtp_header(5, 960, 42);
        let mut packet =
            encrypt_rtp_packet(&secret_key, 99, &header, b"opus data here").unwrap();

        packet[RTP_HEADER_SIZE] ^= 0x01;
        assert_eq!(
            decrypt_rtp_packet(&secret_key, &packet),
            Err(VoiceUdpError::FailedDecryption)
        );
    }

    #[test]
    fn dave_frame_survives_transport_roundtrip() {
        use crate::dave::decryptor::Decryptor;
        use crate::dave::encryptor::Encryptor;
        use crate::dave::ratchet::MlsKeyRatchet;
        use crate::dave::{MediaType, RATCHET_EXPIRY};
        use zeroize::Zeroizing;

        let ratchet = || Box::new(MlsKeyRatchet::new(Zeroizing::new(vec![0u8; 16])));

        let encryptor = Encryptor::new();
        encryptor.set_key_ratchet(ratchet());
        let mut decryptor = Decryptor::new();
        decryptor.transition_to_key_ratchet(ratchet(), RATCHET_EXPIRY);

        // inner opus packet -> dave frame -> transport rtp packet
        let opus = [0x78u8, 0x01, 0x02, 0x03];
        let dave_frame = encryptor.encrypt(MediaType::Audio, 1234, &opus).unwrap();

        let secret_key = [3u8; 32];
        let header = build_rtp_header(7, 1920, 1234);
        let rtp = encrypt_rtp_packet(&secret_key, 1, &header, &dave_frame).unwrap();

        // receiver: transport decrypt, then dave decrypt
        let received_dave = decrypt_rtp_packet(&secret_key, &rtp).unwrap();
        assert_eq!(received_dave, dave_frame);
        let received_opus = decryptor.decrypt(MediaType::Audio, &received_dave).unwrap();
        assert_eq!(received_opus, opus);
    }

    #[test]
    fn extension_is_stripped_after_decryption() {
        let secret_key = [1u8; 32];

        // hand-build a packet with the extension bit set: the 4 byte
        // extension header is part of the AAD, the 8 byte extension body is
        // encrypted in front of the media payload
        let mut header_and_ext = Vec::new();
        let mut header = build_rtp_header(1, 480, 77);
        header[0] |= 0x10;
        header_and_ext.extend_from_slice(&header);
        header_and_ext.extend_from_slice(&[0xbe, 0xde, 0x00, 0x02]);

        let extension_body = [0xaau8; 8];
        let media = b"actual opus";
        let mut plaintext = extension_body.to_vec();
        plaintext.extend_from_slice(media);

        let nonce = get_xchacha20_poly1305_rtpsize_nonce(3);
        let cipher = XChaCha20Poly1305Cipher::new(&secret_key);
        let mut ciphertext = vec![0u8; plaintext.len()];
        let mut tag = [0u8; TAG_SIZE];
        assert!(cipher.encrypt(&mut ciphertext, &plaintext, &nonce, &header_and_ext, &mut tag));

        let mut packet = header_and_ext.clone();
        packet.extend_from_slice(&ciphertext);
        packet.extend_from_slice(&tag);
        packet.extend_from_slice(&nonce[..4]);

        let decrypted = decrypt_rtp_packet(&secret_key, &packet).unwrap();
        assert_eq!(decrypted, media);
    }
}
