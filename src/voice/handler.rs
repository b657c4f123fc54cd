// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use log::*;
use pubserve::Subscriber;
use tokio::sync::{Mutex, RwLock};

use crate::dave::displayable_code::{generate_displayable_code, pairwise_fingerprint};
use crate::dave::encryptor::Encryptor;
use crate::dave::session::{CommitProcessing, MlsSession};
use crate::dave::{
    MediaType, CIPHER_EXPIRY, DISABLED_PROTOCOL_VERSION, MAX_PROTOCOL_VERSION, OPUS_SILENCE_PACKET,
    RATCHET_EXPIRY,
};
use crate::errors::{VoiceGatewayError, VoiceUdpError};
use crate::types::{
    DaveBinaryMessage, DaveExecuteTransition, DavePrepareEpoch, DavePrepareTransition,
    SelectProtocol, SelectProtocolData, SessionDescription, Snowflake, Speaking,
    VoiceClientConnect, VoiceClientDisconnection, VoiceEncryptionMode, VoiceIdentify, VoiceReady,
    VoiceResume, VOICE_DAVE_MLS_ANNOUNCE_COMMIT_TRANSITION, VOICE_DAVE_MLS_COMMIT_MESSAGE,
    VOICE_DAVE_MLS_EXTERNAL_SENDER, VOICE_DAVE_MLS_KEY_PACKAGE, VOICE_DAVE_MLS_PROPOSALS,
    VOICE_DAVE_MLS_WELCOME,
};

use super::courier::{CourierHandle, DecoderControl, DecryptorMap, ParkingLot};
use super::events::{VoiceClientEvents, VoiceReadyEvent};
use super::gateway::{VoiceGateway, VoiceGatewayHandle};
use super::opus::{self, VoiceOpusEncoder, SEND_AUDIO_RAW_MAX_LENGTH};
use super::udp::{SendAudioType, UdpHandle, UdpHandler};
use super::voice_data::VoiceData;

/// How long to wait between reconnection attempts after a recoverable
/// gateway close.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// How many reconnection attempts to make before giving up on the session.
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Everything the host has to provide to join a voice channel.
#[derive(Debug, Clone, Default)]
pub struct VoiceSessionOptions {
    /// Voice gateway endpoint from the voice server update (host:port)
    pub endpoint: String,
    /// Voice token from the voice server update (not the bot token)
    pub token: String,
    /// Session id from the main gateway's voice state update; also keys the
    /// persisted DAVE signature key pair
    pub session_id: String,
    /// The guild id, or the private channel id for DM calls
    pub server_id: Snowflake,
    pub channel_id: Snowflake,
    /// The bot's user id
    pub user_id: Snowflake,
    /// Whether to offer DAVE end-to-end encryption
    pub enable_dave: bool,
}

/// An announced but not yet applied protocol version change.
#[derive(Debug, Clone, Copy, Default)]
struct PendingTransition {
    id: u16,
    protocol_version: u8,
    is_pending: bool,
}

/// The DAVE state of a session; exists only while end-to-end encryption is
/// negotiated or being negotiated.
struct DaveState {
    session: MlsSession,
    encryptor: Arc<Encryptor>,
    transition_id: u16,
    pending_transition: PendingTransition,
    privacy_code: String,
    /// Whether the ready event was already fired for this session
    done_ready: bool,
}

/// The main handle to a voice connection: drives the gateway state machine,
/// owns the DAVE session, and exposes the send/receive surface.
///
/// Can be safely cloned; clones correspond to the same session.
#[derive(Clone)]
pub struct VoiceHandler {
    pub data: Arc<RwLock<VoiceData>>,
    pub events: Arc<Mutex<VoiceClientEvents>>,
    pub voice_gateway_connection: Arc<Mutex<Option<VoiceGatewayHandle>>>,
    pub voice_udp_connection: Arc<Mutex<Option<UdpHandle>>>,

    courier: CourierHandle,
    decryptors: Arc<StdMutex<DecryptorMap>>,
    dave: Arc<Mutex<Option<DaveState>>>,
    /// Users currently known to be in the channel, eligible for the MLS group
    recognized_users: Arc<Mutex<BTreeSet<Snowflake>>>,
    /// Users to drop from the recognized set at the next DAVE (re)init
    pending_remove: Arc<Mutex<BTreeSet<Snowflake>>>,
    encoder: Arc<Mutex<Option<VoiceOpusEncoder>>>,
    reconnect_attempts: Arc<Mutex<u32>>,
}

impl std::fmt::Debug for VoiceHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VoiceHandler")
    }
}

impl VoiceHandler {
    /// Creates a voice handler and connects it to the voice gateway.
    pub async fn spawn(options: VoiceSessionOptions) -> Result<Arc<VoiceHandler>, VoiceGatewayError> {
        let mut data = VoiceData {
            server_id: options.server_id,
            channel_id: options.channel_id,
            user_id: options.user_id,
            session_id: options.session_id,
            token: options.token,
            endpoint: options.endpoint,
            receive_sequence: -1,
            packet_nonce: 1,
            ..Default::default()
        };
        data.dave_version = if options.enable_dave {
            MAX_PROTOCOL_VERSION
        } else {
            DISABLED_PROTOCOL_VERSION
        };

        let handler = Arc::new(VoiceHandler {
            data: Arc::new(RwLock::new(data)),
            events: Arc::new(Mutex::new(VoiceClientEvents::default())),
            voice_gateway_connection: Arc::new(Mutex::new(None)),
            voice_udp_connection: Arc::new(Mutex::new(None)),
            courier: CourierHandle::new(),
            decryptors: Arc::new(StdMutex::new(DecryptorMap::new())),
            dave: Arc::new(Mutex::new(None)),
            recognized_users: Arc::new(Mutex::new(BTreeSet::new())),
            pending_remove: Arc::new(Mutex::new(BTreeSet::new())),
            encoder: Arc::new(Mutex::new(None)),
            reconnect_attempts: Arc::new(Mutex::new(0)),
        });

        handler.connect(false).await?;
        Ok(handler)
    }

    /// Connects (or resumes) the voice gateway and subscribes this handler
    /// to its events.
    async fn connect(&self, resume: bool) -> Result<(), VoiceGatewayError> {
        let (endpoint, receive_sequence) = {
            let data = self.data.read().await;
            (data.endpoint.clone(), data.receive_sequence)
        };

        let gateway_handle = VoiceGateway::spawn(&endpoint, receive_sequence).await?;

        let self_reference = Arc::new(self.clone());
        {
            let mut gateway_events = gateway_handle.events.lock().await;
            gateway_events.voice_ready.subscribe(self_reference.clone());
            gateway_events
                .session_description
                .subscribe(self_reference.clone());
            gateway_events.speaking.subscribe(self_reference.clone());
            gateway_events
                .client_connect
                .subscribe(self_reference.clone());
            gateway_events
                .client_disconnect
                .subscribe(self_reference.clone());
            gateway_events
                .dave_prepare_transition
                .subscribe(self_reference.clone());
            gateway_events
                .dave_execute_transition
                .subscribe(self_reference.clone());
            gateway_events
                .dave_prepare_epoch
                .subscribe(self_reference.clone());
            gateway_events.dave_binary.subscribe(self_reference.clone());
            gateway_events.error.subscribe(self_reference.clone());
        }

        let data = self.data.read().await;
        if resume {
            debug!("VGW: Resuming voice session {}", data.session_id);
            gateway_handle
                .send_resume(VoiceResume {
                    server_id: data.server_id,
                    session_id: data.session_id.clone(),
                    token: data.token.clone(),
                    seq_ack: data.receive_sequence,
                })
                .await;
        } else {
            debug!(
                "VGW: Connecting new voice session (DAVE: {})",
                if data.dave_version != DISABLED_PROTOCOL_VERSION {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            gateway_handle
                .send_identify(VoiceIdentify {
                    server_id: data.server_id,
                    user_id: data.user_id,
                    session_id: data.session_id.clone(),
                    token: data.token.clone(),
                    video: Some(false),
                    max_dave_protocol_version: data.dave_version,
                })
                .await;
        }
        drop(data);

        *self.voice_gateway_connection.lock().await = Some(gateway_handle);
        Ok(())
    }

    // ------------------------------------------------------------------
    // The public audio surface
    // ------------------------------------------------------------------

    /// Sends raw 48 kHz interleaved stereo PCM (16 bit little endian
    /// samples).
    ///
    /// The input must be at least 4 bytes and a multiple of 4 bytes (one
    /// stereo sample). Inputs longer than [SEND_AUDIO_RAW_MAX_LENGTH] are
    /// split into multiple packets; shorter ones are zero padded.
    pub async fn send_audio_raw(&self, audio: &[u8]) -> Result<(), VoiceUdpError> {
        if audio.len() < 4 || audio.len() % 4 != 0 {
            return Err(VoiceUdpError::InvalidAudioLength);
        }

        let mut offset = 0;
        while offset < audio.len() {
            let end = usize::min(offset + SEND_AUDIO_RAW_MAX_LENGTH, audio.len());
            let mut packet = audio[offset..end].to_vec();
            packet.resize(SEND_AUDIO_RAW_MAX_LENGTH, 0);

            let encoded = {
                let mut encoder = self.encoder.lock().await;
                if encoder.is_none() {
                    *encoder = Some(VoiceOpusEncoder::new()?);
                }
                encoder.as_mut().expect("just initialized").encode(&packet)?
            };

            self.send_audio_opus(&encoded, None).await?;
            offset = end;
        }

        Ok(())
    }

    /// Sends a pre-encoded Opus packet. The duration is derived from the
    /// packet itself unless given.
    ///
    /// With DAVE active the packet is end-to-end encrypted before it is
    /// sealed for transport.
    pub async fn send_audio_opus(
        &self,
        opus_packet: &[u8],
        duration_ms: Option<u64>,
    ) -> Result<(), VoiceUdpError> {
        let duration = match duration_ms {
            Some(duration) => duration,
            None => opus::packet_duration_ms(opus_packet)?,
        };

        let mut payload = opus_packet.to_vec();

        if self.is_end_to_end_encrypted().await {
            let ssrc = self.data.read().await.ssrc().unwrap_or_default();
            let dave = self.dave.lock().await;
            if let Some(state) = dave.as_ref() {
                match state.encryptor.encrypt(MediaType::Audio, ssrc, &payload) {
                    Ok(encrypted) => payload = encrypted,
                    Err(e) => warn!("DAVE: Encryption failure, sending frame unprotected: {e}"),
                }
            }
        }

        let udp = self
            .voice_udp_connection
            .lock()
            .await
            .clone()
            .ok_or(VoiceUdpError::NoData)?;
        udp.send_payload(&payload, duration, false).await?;

        self.speak().await;
        Ok(())
    }

    /// Queues `duration_ms` worth of the canonical 3 byte silence packet.
    pub async fn send_silence(&self, duration_ms: u64) -> Result<(), VoiceUdpError> {
        self.send_audio_opus(&OPUS_SILENCE_PACKET, Some(duration_ms))
            .await
    }

    /// Inserts a track marker into the outbound queue.
    pub async fn insert_marker(&self, metadata: String) -> Result<(), VoiceUdpError> {
        let udp = self
            .voice_udp_connection
            .lock()
            .await
            .clone()
            .ok_or(VoiceUdpError::NoData)?;
        udp.insert_marker(metadata).await;
        Ok(())
    }

    /// Pauses or resumes sending. The queue is kept.
    pub async fn pause_audio(&self, pause: bool) -> Result<(), VoiceUdpError> {
        let udp = self
            .voice_udp_connection
            .lock()
            .await
            .clone()
            .ok_or(VoiceUdpError::NoData)?;
        udp.pause(pause).await;
        Ok(())
    }

    pub async fn is_paused(&self) -> bool {
        self.data.read().await.paused
    }

    /// Drops everything queued and sends stop frames.
    pub async fn stop_audio(&self) -> Result<(), VoiceUdpError> {
        let udp = self
            .voice_udp_connection
            .lock()
            .await
            .clone()
            .ok_or(VoiceUdpError::NoData)?;
        udp.stop_audio().await;
        Ok(())
    }

    /// Skips everything queued up to and including the next track marker.
    pub async fn skip_to_next_marker(&self) -> Result<(), VoiceUdpError> {
        let udp = self
            .voice_udp_connection
            .lock()
            .await
            .clone()
            .ok_or(VoiceUdpError::NoData)?;
        udp.skip_to_next_marker().await;
        Ok(())
    }

    pub async fn get_secs_remaining(&self) -> f32 {
        match self.voice_udp_connection.lock().await.clone() {
            Some(udp) => udp.get_secs_remaining().await,
            None => 0.0,
        }
    }

    pub async fn get_tracks_remaining(&self) -> u32 {
        match self.voice_udp_connection.lock().await.clone() {
            Some(udp) => udp.get_tracks_remaining().await,
            None => 0,
        }
    }

    pub async fn get_marker_metadata(&self) -> Vec<String> {
        match self.voice_udp_connection.lock().await.clone() {
            Some(udp) => udp.get_marker_metadata().await,
            None => Vec::new(),
        }
    }

    pub async fn is_playing(&self) -> bool {
        match self.voice_udp_connection.lock().await.clone() {
            Some(udp) => udp.is_playing().await,
            None => false,
        }
    }

    /// Whether the session has its transport key and can send audio.
    pub async fn is_ready(&self) -> bool {
        self.data.read().await.secret_key.is_some()
    }

    pub async fn set_send_audio_type(&self, send_audio_type: SendAudioType) {
        if let Some(udp) = self.voice_udp_connection.lock().await.clone() {
            udp.set_send_audio_type(send_audio_type).await;
        }
    }

    /// Adjusts the playback gain for one speaker. A factor of 0.0 mutes
    /// them, 1.0 is unchanged. Takes effect on the next courier iteration.
    pub fn set_user_gain(&self, user_id: Snowflake, factor: f32) {
        if factor < 0.0 {
            // Invalid factor; must be nonnegative
            return;
        }

        let gain = if factor == 0.0 {
            // log10(0) is undefined; hardcode the Opus minimum so the user
            // is actually muted
            -32768
        } else {
            // OPUS_SET_GAIN takes Q8 dB units: x = log10(factor) * 20 * 256
            (factor.log10() * 20.0 * 256.0).clamp(-32768.0, 32767.0) as i32
        };

        // Using the entry API on purpose, so a gain can be set before the
        // user has ever spoken
        let mut shared = self
            .courier
            .shared
            .lock()
            .expect("courier state mutex poisoned");
        shared
            .parked_voice_payloads
            .entry(user_id)
            .or_insert_with(ParkingLot::default)
            .pending_decoder_ctls
            .push(DecoderControl::SetGain(gain));
    }

    // ------------------------------------------------------------------
    // End-to-end encryption surface
    // ------------------------------------------------------------------

    /// Whether media is end-to-end encrypted right now: DAVE is negotiated,
    /// no downgrade is pending, and the encryptor has a key ratchet bound.
    pub async fn is_end_to_end_encrypted(&self) -> bool {
        if self.data.read().await.dave_version == DISABLED_PROTOCOL_VERSION {
            return false;
        }

        let dave = self.dave.lock().await;
        match dave.as_ref() {
            Some(state) => {
                let has_pending_downgrade = state.pending_transition.is_pending
                    && state.pending_transition.protocol_version != MAX_PROTOCOL_VERSION;
                !has_pending_downgrade && state.encryptor.has_key_ratchet()
            }
            None => false,
        }
    }

    /// The session verification code of the current MLS epoch, or an empty
    /// string when the session is not end-to-end encrypted.
    pub async fn get_privacy_code(&self) -> String {
        if !self.is_end_to_end_encrypted().await {
            return String::new();
        }
        self.dave
            .lock()
            .await
            .as_ref()
            .map(|state| state.privacy_code.clone())
            .unwrap_or_default()
    }

    /// Computes the pairwise verification code between us and `user_id`.
    ///
    /// This runs scrypt and is therefore performed on a blocking worker;
    /// returns an empty string when the session is not end-to-end encrypted
    /// or the user is unknown.
    pub async fn get_user_privacy_code(&self, user_id: Snowflake) -> String {
        if !self.is_end_to_end_encrypted().await {
            return String::new();
        }

        let (own_key, their_key, own_user_id) = {
            let dave = self.dave.lock().await;
            let Some(state) = dave.as_ref() else {
                return String::new();
            };
            let Some((own_key, their_key)) = state.session.pairwise_fingerprint_material(user_id)
            else {
                return String::new();
            };
            (own_key, their_key, state.session.bot_user_id())
        };

        tokio::task::spawn_blocking(move || {
            match pairwise_fingerprint(0x0000, &own_key, own_user_id.0, &their_key, user_id.0) {
                Some(digest) if digest.len() == 64 => generate_displayable_code(&digest, 45, 5),
                _ => String::new(),
            }
        })
        .await
        .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Leaves the voice session: closes the gateway and UDP connections and
    /// winds down the courier.
    pub async fn close(&self) {
        self.data.write().await.terminating = true;
        self.courier.terminate();

        if let Some(gateway) = self.voice_gateway_connection.lock().await.take() {
            gateway.close().await;
        }
        if let Some(udp) = self.voice_udp_connection.lock().await.take() {
            udp.close();
        }
    }

    /// Announces us as speaking before the first audio packet.
    async fn speak(&self) {
        let (ssrc, already_speaking) = {
            let data = self.data.read().await;
            (data.ssrc().unwrap_or_default(), data.speaking)
        };

        if already_speaking {
            return;
        }

        if let Some(gateway) = self.voice_gateway_connection.lock().await.clone() {
            gateway
                .send_speaking(Speaking {
                    speaking: 1,
                    delay: 0,
                    ssrc,
                    user_id: None,
                })
                .await;
            self.data.write().await.speaking = true;
        }
    }

    // ------------------------------------------------------------------
    // DAVE internals
    // ------------------------------------------------------------------

    /// Starts (or restarts) the DAVE MLS session and sends our key package.
    async fn reinit_dave_mls_group(&self) {
        let (dave_version, channel_id, user_id, session_id) = {
            let data = self.data.read().await;
            (
                data.dave_version,
                data.channel_id,
                data.user_id,
                data.session_id.clone(),
            )
        };

        let mut dave = self.dave.lock().await;

        if dave_version != DISABLED_PROTOCOL_VERSION {
            let session = match MlsSession::new(
                dave_version,
                channel_id,
                user_id,
                Some(&session_id),
            ) {
                Ok(session) => session,
                Err(e) => {
                    warn!("DAVE: Failed to create MLS session: {e}");
                    return;
                }
            };

            let mut state = DaveState {
                session,
                encryptor: Arc::new(Encryptor::new()),
                transition_id: dave.as_ref().map(|s| s.transition_id).unwrap_or_default(),
                pending_transition: PendingTransition::default(),
                privacy_code: String::new(),
                done_ready: dave.as_ref().map(|s| s.done_ready).unwrap_or_default(),
            };

            match state.session.get_marshalled_key_package() {
                Ok(key_package) => {
                    if let Some(gateway) = self.voice_gateway_connection.lock().await.clone() {
                        gateway
                            .send_binary(VOICE_DAVE_MLS_KEY_PACKAGE, &key_package)
                            .await;
                    }
                }
                Err(e) => warn!("DAVE: Failed to marshal key package: {e}"),
            }

            *dave = Some(state);
        }

        self.decryptors
            .lock()
            .expect("decryptor map mutex poisoned")
            .clear();

        // Drop users that disconnected while we were (re)initializing
        let mut recognized = self.recognized_users.lock().await;
        let mut pending_remove = self.pending_remove.lock().await;
        for user in pending_remove.iter() {
            recognized.remove(user);
        }
        pending_remove.clear();
    }

    /// Replaces every recognized user's decryptor ratchet and the
    /// encryptor's own ratchet with the current epoch's, then refreshes the
    /// privacy code.
    async fn update_ratchets(&self) {
        let mut dave = self.dave.lock().await;
        let Some(state) = dave.as_mut() else {
            return;
        };

        let recognized = self.recognized_users.lock().await;
        let own_user_id = self.data.read().await.user_id;

        debug!(
            "DAVE: Updating MLS ratchets for {} user(s)",
            recognized.len() + 1
        );

        {
            let mut decryptors = self
                .decryptors
                .lock()
                .expect("decryptor map mutex poisoned");
            for user in recognized.iter() {
                if *user == own_user_id {
                    continue;
                }

                let Some(ratchet) = state.session.get_key_ratchet(*user) else {
                    continue;
                };

                let decryptor = decryptors.entry(*user).or_insert_with(|| {
                    debug!("DAVE: Inserting decryptor key ratchet for new user: {user}");
                    Arc::new(StdMutex::new(crate::dave::decryptor::Decryptor::new()))
                });
                decryptor
                    .lock()
                    .expect("decryptor mutex poisoned")
                    .transition_to_key_ratchet(Box::new(ratchet), RATCHET_EXPIRY);
            }
        }

        // Ratchet for sending our own audio
        if let Some(own_ratchet) = state.session.get_key_ratchet(own_user_id) {
            debug!("DAVE: Setting key ratchet for sending audio");
            state.encryptor.set_key_ratchet(Box::new(own_ratchet));
        }

        // If one group member is being impersonated, their epoch
        // authenticator differs from everyone else's; surfacing it as a
        // displayable code lets users verify out of band
        let old_code = state.privacy_code.clone();
        state.privacy_code =
            generate_displayable_code(&state.session.get_last_epoch_authenticator(), 30, 5);
        if !state.privacy_code.is_empty() && state.privacy_code != old_code {
            info!("New E2EE privacy code: {}", state.privacy_code);
        }
    }

    /// Acknowledges a transition and, for the initial transition id 0,
    /// applies it immediately. Fires the ready event the first time.
    async fn ready_for_transition(&self) {
        let transition_id = {
            let mut dave = self.dave.lock().await;
            let Some(state) = dave.as_mut() else {
                return;
            };
            state.pending_transition.id = state.transition_id;
            state.transition_id
        };

        debug!("DAVE: Ready to execute transition {transition_id}");

        if let Some(gateway) = self.voice_gateway_connection.lock().await.clone() {
            gateway.send_transition_ready(transition_id).await;
        }

        // Transition id 0 is for (re)initialization and is executed
        // immediately
        if transition_id == 0 {
            self.update_ratchets().await;
        }

        let fire_ready = {
            let mut dave = self.dave.lock().await;
            match dave.as_mut() {
                Some(state) if !state.done_ready => {
                    state.done_ready = true;
                    true
                }
                _ => false,
            }
        };

        if fire_ready {
            self.fire_voice_ready().await;
        }
    }

    /// Signals the gateway that we could not process a commit or welcome and
    /// starts over with a fresh MLS session.
    async fn recover_from_invalid_commit_welcome(&self) {
        let transition_id = self
            .dave
            .lock()
            .await
            .as_ref()
            .map(|state| state.transition_id)
            .unwrap_or_default();

        if let Some(gateway) = self.voice_gateway_connection.lock().await.clone() {
            gateway.send_invalid_commit_welcome(transition_id).await;
        }

        self.reinit_dave_mls_group().await;
    }

    /// Applies a pending protocol upgrade or downgrade. Returns whether one
    /// was applied.
    async fn execute_pending_upgrade_downgrade(&self) -> bool {
        let mut dave = self.dave.lock().await;
        let Some(state) = dave.as_mut() else {
            return false;
        };

        let mut did_upgrade_downgrade = false;

        if state.transition_id != state.pending_transition.id {
            debug!(
                "DAVE: Unexpected transition id {}, we never received a matching prepare",
                state.transition_id
            );
        } else {
            let new_version = state.pending_transition.protocol_version;
            let current_version = self.data.read().await.dave_version;

            if new_version != current_version {
                self.data.write().await.dave_version = new_version;

                if new_version == DISABLED_PROTOCOL_VERSION {
                    debug!("DAVE: Downgrading to passthrough mode");
                    state.encryptor.set_passthrough_mode(true);
                    let decryptors = self
                        .decryptors
                        .lock()
                        .expect("decryptor map mutex poisoned");
                    for decryptor in decryptors.values() {
                        decryptor
                            .lock()
                            .expect("decryptor mutex poisoned")
                            .transition_to_passthrough_mode(true, CIPHER_EXPIRY);
                    }
                } else {
                    debug!("DAVE: Upgrading to protocol version {new_version}");
                    state.encryptor.set_passthrough_mode(false);
                    let decryptors = self
                        .decryptors
                        .lock()
                        .expect("decryptor map mutex poisoned");
                    for decryptor in decryptors.values() {
                        decryptor
                            .lock()
                            .expect("decryptor mutex poisoned")
                            .transition_to_passthrough_mode(false, CIPHER_EXPIRY);
                    }
                }

                did_upgrade_downgrade = true;
            }
        }

        state.pending_transition.is_pending = false;
        did_upgrade_downgrade
    }

    /// Applies an MLS roster change: users with an empty key were removed
    /// from the group.
    async fn process_mls_group_rosters(&self, roster: crate::dave::session::RosterMap) {
        debug!("DAVE: Processing MLS group roster of size {}", roster.len());

        for (user_id, key) in roster {
            if !key.is_empty() {
                debug!("DAVE: Added or changed user in MLS group: {user_id}");
                continue;
            }

            let user = Snowflake(user_id);
            debug!("DAVE: Removed user from MLS group: {user}");

            self.recognized_users.lock().await.remove(&user);
            self.pending_remove.lock().await.remove(&user);
            self.decryptors
                .lock()
                .expect("decryptor map mutex poisoned")
                .remove(&user);
        }
    }

    async fn fire_voice_ready(&self) {
        // Sending a short silence burst first makes sure the receive path
        // opens without the start of transmission being cut off
        let _ = self.send_silence(20).await;

        let (channel_id, ssrc) = {
            let data = self.data.read().await;
            (data.channel_id, data.ssrc().unwrap_or_default())
        };

        self.events
            .lock()
            .await
            .ready
            .publish(VoiceReadyEvent { channel_id, ssrc })
            .await;
    }
}

// On [VoiceReady] we get the UDP endpoint and our ssrc, and immediately need
// said UDP connection for ip discovery.
#[async_trait]
impl Subscriber<VoiceReady> for VoiceHandler {
    async fn update(&self, data: &VoiceReady) {
        debug!(
            "VGW: Voice ready; UDP endpoint {}:{} [ssrc={}] with {} modes",
            data.ip,
            data.port,
            data.ssrc,
            data.modes.len()
        );

        {
            let mut data_lock = self.data.write().await;
            data_lock.ready_data = Some(data.clone());
        }

        let udp_result = UdpHandler::spawn(
            self.data.clone(),
            SocketAddr::new(IpAddr::V4(data.ip), data.port),
            data.ssrc,
            self.events.clone(),
            self.courier.clone(),
            self.decryptors.clone(),
        )
        .await;

        let udp_handle = match udp_result {
            Ok(handle) => handle,
            Err(e) => {
                warn!("VUDP: Could not establish the UDP connection: {e}");
                self.close().await;
                return;
            }
        };

        let Some((address, port)) = self.data.read().await.external_address.clone() else {
            // discovery failed, cannot select a protocol; the session aborts
            warn!("VUDP: No external address discovered, aborting session");
            self.close().await;
            return;
        };

        *self.voice_udp_connection.lock().await = Some(udp_handle);

        if let Some(gateway) = self.voice_gateway_connection.lock().await.clone() {
            gateway
                .send_select_protocol(SelectProtocol {
                    protocol: Default::default(),
                    data: SelectProtocolData {
                        address,
                        port,
                        mode: VoiceEncryptionMode::AeadXchacha20Poly1305Rtpsize,
                    },
                })
                .await;
        }
    }
}

// The session description gives us the transport key and the negotiated DAVE
// version; for non-DAVE sessions we are ready afterwards.
#[async_trait]
impl Subscriber<SessionDescription> for VoiceHandler {
    async fn update(&self, description: &SessionDescription) {
        let requested_dave = {
            let mut data_lock = self.data.write().await;
            data_lock.secret_key = Some(zeroize::Zeroizing::new(description.secret_key));
            // A fresh secret key restarts the nonce space
            data_lock.packet_nonce = 1;
            data_lock.dave_version != DISABLED_PROTOCOL_VERSION
        };

        let mut ready_now = true;

        if requested_dave {
            let dave_incapable =
                description.dave_protocol_version == DISABLED_PROTOCOL_VERSION;
            if dave_incapable {
                error!("DAVE: We requested E2EE but didn't receive it from the server, downgrading...");
                self.data.write().await.dave_version = DISABLED_PROTOCOL_VERSION;
            } else {
                self.data.write().await.dave_version = description.dave_protocol_version;
            }

            if !dave_incapable {
                self.reinit_dave_mls_group().await;
                // DAVE sessions with other members become ready once the
                // first transition executes
                ready_now = self.recognized_users.lock().await.is_empty();
            }
        }

        if ready_now {
            let fire = {
                let mut dave = self.dave.lock().await;
                match dave.as_mut() {
                    Some(state) if !state.done_ready => {
                        state.done_ready = true;
                        true
                    }
                    Some(_) => false,
                    None => true,
                }
            };
            if fire {
                self.fire_voice_ready().await;
            }
        }
    }
}

// Speaking events attribute an ssrc to a user id, which the receive path
// needs to deliver audio per speaker.
#[async_trait]
impl Subscriber<Speaking> for VoiceHandler {
    async fn update(&self, speaking: &Speaking) {
        if let Some(user_id) = speaking.user_id {
            self.data
                .write()
                .await
                .ssrc_map
                .insert(speaking.ssrc, user_id);
        }

        self.events
            .lock()
            .await
            .client_speaking
            .publish(speaking.clone())
            .await;
    }
}

#[async_trait]
impl Subscriber<VoiceClientConnect> for VoiceHandler {
    async fn update(&self, connect: &VoiceClientConnect) {
        let mut recognized = self.recognized_users.lock().await;
        let mut pending_remove = self.pending_remove.lock().await;

        for user in &connect.user_ids {
            recognized.insert(*user);
            pending_remove.remove(user);
        }

        debug!(
            "VGW: {} client(s) joined the voice channel, total is {}",
            connect.user_ids.len(),
            recognized.len()
        );
    }
}

#[async_trait]
impl Subscriber<VoiceClientDisconnection> for VoiceHandler {
    async fn update(&self, disconnection: &VoiceClientDisconnection) {
        let user_id = disconnection.user_id;
        debug!("VGW: User left voice channel: {user_id}");

        {
            let mut data_lock = self.data.write().await;
            data_lock.ssrc_map.retain(|_, user| *user != user_id);
        }

        // Mark this user for removal at the next DAVE (re)initialization
        self.pending_remove.lock().await.insert(user_id);

        self.events
            .lock()
            .await
            .client_disconnect
            .publish(*disconnection)
            .await;
    }
}

#[async_trait]
impl Subscriber<DavePrepareTransition> for VoiceHandler {
    async fn update(&self, prepare: &DavePrepareTransition) {
        debug!(
            "DAVE: Prepare transition, version={} transition={}",
            prepare.protocol_version, prepare.transition_id
        );

        if prepare.protocol_version > MAX_PROTOCOL_VERSION {
            // Unknown version announced; keep the current one
            warn!(
                "DAVE: Ignoring prepare transition with unsupported protocol version {}",
                prepare.protocol_version
            );
            if let Some(gateway) = self.voice_gateway_connection.lock().await.clone() {
                gateway.send_transition_ready(prepare.transition_id).await;
            }
            return;
        }

        {
            let mut dave = self.dave.lock().await;
            let Some(state) = dave.as_mut() else {
                return;
            };
            state.transition_id = prepare.transition_id;
            state.pending_transition = PendingTransition {
                id: prepare.transition_id,
                protocol_version: prepare.protocol_version,
                is_pending: true,
            };
        }

        if prepare.transition_id == 0 {
            self.execute_pending_upgrade_downgrade().await;
        } else if let Some(gateway) = self.voice_gateway_connection.lock().await.clone() {
            gateway.send_transition_ready(prepare.transition_id).await;
        }
    }
}

#[async_trait]
impl Subscriber<DaveExecuteTransition> for VoiceHandler {
    async fn update(&self, execute: &DaveExecuteTransition) {
        debug!("DAVE: Execute transition {}", execute.transition_id);

        let has_pending = {
            let mut dave = self.dave.lock().await;
            let Some(state) = dave.as_mut() else {
                return;
            };
            state.transition_id = execute.transition_id;
            state.pending_transition.is_pending
        };

        if has_pending && self.execute_pending_upgrade_downgrade().await {
            return;
        }

        // A transition from a commit or welcome: this is the moment the
        // ratchets change, atomically for the next encrypted frame
        self.update_ratchets().await;
    }
}

#[async_trait]
impl Subscriber<DavePrepareEpoch> for VoiceHandler {
    async fn update(&self, prepare: &DavePrepareEpoch) {
        debug!(
            "DAVE: Prepare epoch, version={} epoch={}",
            prepare.protocol_version, prepare.epoch
        );

        if prepare.epoch == 1 {
            // Epoch 1 is the start of a new DAVE session
            {
                let mut data_lock = self.data.write().await;
                data_lock.dave_version = if prepare.protocol_version == MAX_PROTOCOL_VERSION {
                    MAX_PROTOCOL_VERSION
                } else {
                    DISABLED_PROTOCOL_VERSION
                };
            }
            self.reinit_dave_mls_group().await;
        }
    }
}

// The binary MLS frames: external sender, proposals, commits and welcomes.
#[async_trait]
impl Subscriber<DaveBinaryMessage> for VoiceHandler {
    async fn update(&self, message: &DaveBinaryMessage) {
        match message.op_code {
            VOICE_DAVE_MLS_EXTERNAL_SENDER => {
                debug!("DAVE: Received external sender");

                let mut dave = self.dave.lock().await;
                if let Some(state) = dave.as_mut() {
                    if let Err(e) = state.session.set_external_sender(&message.data) {
                        warn!("DAVE: Failed to install external sender: {e}");
                    }
                }
            }
            VOICE_DAVE_MLS_PROPOSALS => {
                debug!("DAVE: Received MLS proposals");

                let response = {
                    let recognized = self.recognized_users.lock().await.clone();
                    let mut dave = self.dave.lock().await;
                    let Some(state) = dave.as_mut() else {
                        return;
                    };
                    state.session.process_proposals(&message.data, &recognized)
                };

                match response {
                    Ok(commit_and_welcome) => {
                        if let Some(gateway) = self.voice_gateway_connection.lock().await.clone()
                        {
                            gateway
                                .send_binary(VOICE_DAVE_MLS_COMMIT_MESSAGE, &commit_and_welcome)
                                .await;
                        }
                    }
                    Err(e) => warn!("DAVE: Failed to process proposals: {e}"),
                }
            }
            VOICE_DAVE_MLS_ANNOUNCE_COMMIT_TRANSITION => {
                debug!("DAVE: Received commit transition announcement");

                let processing = {
                    let mut dave = self.dave.lock().await;
                    let Some(state) = dave.as_mut() else {
                        return;
                    };
                    if let Some(transition_id) = message.transition_id {
                        state.transition_id = transition_id;
                    }
                    state.session.process_commit(&message.data)
                };

                match processing {
                    CommitProcessing::RosterUpdate(roster) => {
                        self.process_mls_group_rosters(roster).await;
                        self.ready_for_transition().await;
                    }
                    CommitProcessing::Failed | CommitProcessing::Ignored => {
                        debug!("DAVE: Unable to process commit, requesting re-init");
                        self.recover_from_invalid_commit_welcome().await;
                    }
                }
            }
            VOICE_DAVE_MLS_WELCOME => {
                debug!(
                    "DAVE: Received MLS welcome with transition id {:?}",
                    message.transition_id
                );

                let result = {
                    // We should always recognize ourselves
                    let own_user_id = self.data.read().await.user_id;
                    let mut recognized = self.recognized_users.lock().await;
                    recognized.insert(own_user_id);
                    let recognized = recognized.clone();

                    let mut dave = self.dave.lock().await;
                    let Some(state) = dave.as_mut() else {
                        return;
                    };
                    if let Some(transition_id) = message.transition_id {
                        state.transition_id = transition_id;
                    }
                    state.session.process_welcome(&message.data, &recognized)
                };

                match result {
                    Ok(roster) => {
                        self.process_mls_group_rosters(roster).await;
                        self.ready_for_transition().await;
                    }
                    Err(e) => {
                        debug!("DAVE: Unable to process welcome: {e}");
                        self.recover_from_invalid_commit_welcome().await;
                    }
                }
            }
            _ => {
                debug!(
                    "DAVE: Unexpected binary frame opcode {}",
                    message.op_code
                );
            }
        }
    }
}

// Gateway errors: recoverable ones trigger a bounded resume-reconnect loop,
// fatal ones terminate the session.
#[async_trait]
impl Subscriber<VoiceGatewayError> for VoiceHandler {
    async fn update(&self, error: &VoiceGatewayError) {
        if self.data.read().await.terminating {
            return;
        }

        if error.is_recoverable() {
            let attempts = {
                let mut attempts = self.reconnect_attempts.lock().await;
                *attempts += 1;
                *attempts
            };

            if attempts <= MAX_RECONNECT_ATTEMPTS {
                warn!(
                    "VGW: Recoverable voice gateway error ({error}), reconnecting (attempt {attempts})"
                );
                tokio::time::sleep(RECONNECT_BACKOFF).await;

                if self.connect(true).await.is_ok() {
                    *self.reconnect_attempts.lock().await = 0;
                    return;
                }
            }
        }

        error!("VGW: Voice session error, giving up on voice connection: {error}");

        let _ = self.stop_audio().await;
        self.close().await;

        self.events.lock().await.error.publish(error.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_handler() -> VoiceHandler {
        VoiceHandler {
            data: Arc::new(RwLock::new(VoiceData::default())),
            events: Arc::new(Mutex::new(VoiceClientEvents::default())),
            voice_gateway_connection: Arc::new(Mutex::new(None)),
            voice_udp_connection: Arc::new(Mutex::new(None)),
            courier: CourierHandle::new(),
            decryptors: Arc::new(StdMutex::new(DecryptorMap::new())),
            dave: Arc::new(Mutex::new(None)),
            recognized_users: Arc::new(Mutex::new(BTreeSet::new())),
            pending_remove: Arc::new(Mutex::new(BTreeSet::new())),
            encoder: Arc::new(Mutex::new(None)),
            reconnect_attempts: Arc::new(Mutex::new(0)),
        }
    }

    #[tokio::test]
    async fn raw_audio_length_boundaries() {
        let handler = bare_handler();

        for length in [0usize, 1, 2, 3] {
            assert_eq!(
                handler.send_audio_raw(&vec![0u8; length]).await,
                Err(VoiceUdpError::InvalidAudioLength),
                "length {length} must be rejected"
            );
        }
        assert_eq!(
            handler.send_audio_raw(&[0u8; 5]).await,
            Err(VoiceUdpError::InvalidAudioLength)
        );

        // 4 bytes passes validation; without a UDP connection the send then
        // fails with NoData, which proves the input made it past the check
        assert_eq!(
            handler.send_audio_raw(&[0u8; 4]).await,
            Err(VoiceUdpError::NoData)
        );
    }

    #[tokio::test]
    async fn oversized_raw_audio_is_split() {
        let handler = bare_handler();

        // (max + 1) x 4 bytes: the first full packet encodes fine, then the
        // send of packet one fails with NoData before the remainder is
        // touched, proving the split loop engaged
        let oversized = vec![0u8; SEND_AUDIO_RAW_MAX_LENGTH + 4];
        assert_eq!(
            handler.send_audio_raw(&oversized).await,
            Err(VoiceUdpError::NoData)
        );
    }

    #[tokio::test]
    async fn privacy_code_is_empty_without_dave() {
        let handler = bare_handler();
        assert!(!handler.is_end_to_end_encrypted().await);
        assert_eq!(handler.get_privacy_code().await, "");
        assert_eq!(handler.get_user_privacy_code(Snowflake(1)).await, "");
    }

    #[tokio::test]
    async fn user_gain_parks_a_decoder_control() {
        let handler = bare_handler();
        handler.set_user_gain(Snowflake(42), 0.0);
        handler.set_user_gain(Snowflake(42), -1.0);

        let shared = handler.courier.shared.lock().unwrap();
        let lot = shared.parked_voice_payloads.get(&Snowflake(42)).unwrap();
        // the negative factor was ignored, the mute was parked
        assert_eq!(lot.pending_decoder_ctls.len(), 1);
        assert!(matches!(
            lot.pending_decoder_ctls[0],
            DecoderControl::SetGain(-32768)
        ));
    }
}
