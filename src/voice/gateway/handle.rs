// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use log::*;

use futures_util::SinkExt;

use tokio::sync::Mutex;

use crate::types::{
    DaveBinaryMessage, DaveInvalidCommitWelcome, DaveTransitionReady, SelectProtocol, Speaking,
    VoiceGatewaySendPayload, VoiceIdentify, VoiceResume, VOICE_DAVE_MLS_INVALID_COMMIT_WELCOME,
    VOICE_DAVE_TRANSITION_READY, VOICE_IDENTIFY, VOICE_RESUME, VOICE_SELECT_PROTOCOL,
    VOICE_SPEAKING,
};

use super::{events::VoiceEvents, Sink, VoiceGatewayBinaryMessage, VoiceGatewayMessage};

/// Represents a handle to a Voice Gateway connection.
/// Using this handle you can send Gateway Events directly.
#[derive(Debug, Clone)]
pub struct VoiceGatewayHandle {
    pub url: String,
    pub events: Arc<Mutex<VoiceEvents>>,
    pub websocket_send: Arc<Mutex<Sink>>,
    /// Tells gateway tasks to close
    pub(super) kill_send: tokio::sync::broadcast::Sender<()>,
}

impl VoiceGatewayHandle {
    /// Sends json to the gateway with an opcode
    async fn send_json(&self, op_code: u8, to_send: serde_json::Value) {
        let gateway_payload = VoiceGatewaySendPayload {
            op_code,
            data: to_send,
        };

        let payload_json = serde_json::to_string(&gateway_payload).unwrap();
        let message = VoiceGatewayMessage(payload_json);

        if let Err(e) = self.websocket_send.lock().await.send(message.into()).await {
            warn!("VGW: Failed to send json frame: {e}");
        }
    }

    /// Sends a binary DAVE frame to the gateway: the opcode byte followed by
    /// the MLS payload.
    pub async fn send_binary(&self, op_code: u8, payload: &[u8]) {
        let message =
            VoiceGatewayBinaryMessage(DaveBinaryMessage::frame_outbound(op_code, payload));

        trace!("VGW: Sending binary DAVE frame, opcode {op_code}");

        if let Err(e) = self.websocket_send.lock().await.send(message.into()).await {
            warn!("VGW: Failed to send binary frame: {e}");
        }
    }

    /// Sends a voice identify event to the gateway
    pub async fn send_identify(&self, to_send: VoiceIdentify) {
        let to_send_value = serde_json::to_value(&to_send).unwrap();

        trace!("VGW: Sending Identify..");

        self.send_json(VOICE_IDENTIFY, to_send_value).await;
    }

    /// Sends a voice resume event to the gateway
    pub async fn send_resume(&self, to_send: VoiceResume) {
        let to_send_value = serde_json::to_value(&to_send).unwrap();

        trace!("VGW: Sending Resume..");

        self.send_json(VOICE_RESUME, to_send_value).await;
    }

    /// Sends a select protocol event to the gateway
    pub async fn send_select_protocol(&self, to_send: SelectProtocol) {
        let to_send_value = serde_json::to_value(&to_send).unwrap();

        trace!("VGW: Sending Select Protocol");

        self.send_json(VOICE_SELECT_PROTOCOL, to_send_value).await;
    }

    /// Sends a speaking event to the gateway
    pub async fn send_speaking(&self, to_send: Speaking) {
        let to_send_value = serde_json::to_value(&to_send).unwrap();

        trace!("VGW: Sending Speaking");

        self.send_json(VOICE_SPEAKING, to_send_value).await;
    }

    /// Tells the gateway we are ready to execute a DAVE transition
    pub async fn send_transition_ready(&self, transition_id: u16) {
        let to_send = DaveTransitionReady { transition_id };
        let to_send_value = serde_json::to_value(to_send).unwrap();

        trace!("VGW: Sending DAVE Transition Ready for transition {transition_id}");

        self.send_json(VOICE_DAVE_TRANSITION_READY, to_send_value)
            .await;
    }

    /// Asks the gateway to reinitialize our MLS state after a commit or
    /// welcome we could not process
    pub async fn send_invalid_commit_welcome(&self, transition_id: u16) {
        let to_send = DaveInvalidCommitWelcome { transition_id };
        let to_send_value = serde_json::to_value(to_send).unwrap();

        trace!("VGW: Sending DAVE Invalid Commit Welcome for transition {transition_id}");

        self.send_json(VOICE_DAVE_MLS_INVALID_COMMIT_WELCOME, to_send_value)
            .await;
    }

    /// Closes the websocket connection and stops all gateway tasks;
    ///
    /// Essentially pulls the plug on the voice gateway, leaving it possible to resume;
    pub async fn close(&self) {
        let _ = self.kill_send.send(());
        let _ = self.websocket_send.lock().await.close().await;
    }
}
