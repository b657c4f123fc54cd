// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{sync::Arc, time::Duration};

use log::*;

use pubserve::Publisher;
use tokio::sync::Mutex;

use futures_util::StreamExt;

use crate::{
    errors::VoiceGatewayError,
    types::{
        DaveBinaryMessage, VoiceCloseCode, VoiceGatewayReceivePayload, VoiceHelloData,
        WebSocketEvent, VOICE_CLIENT_DISCONNECT, VOICE_DAVE_EXECUTE_TRANSITION,
        VOICE_DAVE_MLS_INVALID_COMMIT_WELCOME, VOICE_DAVE_PREPARE_EPOCH,
        VOICE_DAVE_PREPARE_TRANSITION, VOICE_HEARTBEAT, VOICE_HEARTBEAT_ACK, VOICE_HELLO,
        VOICE_IDENTIFY, VOICE_MULTIPLE_CLIENTS_CONNECT, VOICE_READY, VOICE_RESUME,
        VOICE_RESUMED, VOICE_SELECT_PROTOCOL, VOICE_SESSION_DESCRIPTION, VOICE_SPEAKING,
    },
    voice::gateway::{
        heartbeat::VoiceHeartbeatTaskCommunication, VoiceGatewayCommunication,
        VoiceGatewayMessage,
    },
};

use super::{
    events::VoiceEvents, heartbeat::VoiceHeartbeatHandler, Sink, Stream, VoiceGatewayHandle,
    WebSocketBackend,
};

/// The voice gateway protocol version we implement.
///
/// Version 8 introduces heartbeat sequence acknowledgement and the DAVE
/// opcodes.
const VOICE_GATEWAY_VERSION: u8 = 8;

/// Heartbeats are sent at roughly this fraction of the interval the server
/// announces, leaving headroom for scheduling delays.
const HEARTBEAT_INTERVAL_FACTOR: f64 = 0.75;

#[derive(Debug)]
pub struct VoiceGateway {
    events: Arc<Mutex<VoiceEvents>>,
    heartbeat_handler: VoiceHeartbeatHandler,
    websocket_send: Arc<Mutex<Sink>>,
    websocket_receive: Stream,
    kill_send: tokio::sync::broadcast::Sender<()>,
    kill_receive: tokio::sync::broadcast::Receiver<()>,
}

impl VoiceGateway {
    /// Connects to a voice gateway endpoint, waits for the hello, and spawns
    /// the listener and heartbeat tasks.
    ///
    /// `starting_seq_ack` is the last sequence number seen on a previous
    /// connection of this session, or -1 for a fresh one.
    #[allow(clippy::new_ret_no_self)]
    pub async fn spawn(
        websocket_url: &str,
        starting_seq_ack: i32,
    ) -> Result<VoiceGatewayHandle, VoiceGatewayError> {
        // Append the needed things to the websocket url
        let processed_url = format!("wss://{}/?v={}", websocket_url, VOICE_GATEWAY_VERSION);
        trace!("VGW: Connecting to {}", processed_url.clone());

        let (websocket_send, mut websocket_receive) =
            match WebSocketBackend::connect(&processed_url).await {
                Ok(streams) => streams,
                Err(e) => {
                    return Err(VoiceGatewayError::CannotConnect {
                        error: format!("{:?}", e),
                    })
                }
            };

        let shared_websocket_send = Arc::new(Mutex::new(websocket_send));

        // Create a shared broadcast channel for killing all gateway tasks
        let (kill_send, mut _kill_receive) = tokio::sync::broadcast::channel::<()>(16);

        // Wait for the first hello and then spawn both tasks so we avoid nested tasks
        // This automatically spawns the heartbeat task, but from the main thread
        let msg: VoiceGatewayMessage = {
            let communication: VoiceGatewayCommunication =
                websocket_receive.next().await.unwrap().unwrap().into();

            match communication {
                VoiceGatewayCommunication::Message(message) => message,
                VoiceGatewayCommunication::Binary(_) => {
                    return Err(VoiceGatewayError::NonHelloOnInitiate { opcode: u8::MAX })
                }
                VoiceGatewayCommunication::Error(close_code) => {
                    return Err(VoiceGatewayError::from(close_code))
                }
            }
        };

        let gateway_payload: VoiceGatewayReceivePayload = serde_json::from_str(&msg.0).unwrap();

        if gateway_payload.op_code != VOICE_HELLO {
            return Err(VoiceGatewayError::NonHelloOnInitiate {
                opcode: gateway_payload.op_code,
            });
        }

        info!("VGW: Received Hello");

        // The hello data for voice gateways is in float milliseconds, so we convert it to f64 seconds
        let gateway_hello: VoiceHelloData =
            serde_json::from_str(gateway_payload.data.get()).unwrap();
        let heartbeat_interval_seconds: f64 =
            gateway_hello.heartbeat_interval * HEARTBEAT_INTERVAL_FACTOR / 1000.0;

        let voice_events = VoiceEvents::default();
        let shared_events = Arc::new(Mutex::new(voice_events));

        let mut gateway = VoiceGateway {
            events: shared_events.clone(),
            heartbeat_handler: VoiceHeartbeatHandler::new(
                Duration::from_secs_f64(heartbeat_interval_seconds),
                starting_seq_ack,
                shared_websocket_send.clone(),
                kill_send.subscribe(),
            ),
            websocket_send: shared_websocket_send.clone(),
            websocket_receive,
            kill_send: kill_send.clone(),
            kill_receive: kill_send.subscribe(),
        };

        // Now we can continuously check for messages in a different task, since we aren't going to receive another hello
        tokio::task::spawn(async move {
            gateway.gateway_listen_task().await;
        });

        Ok(VoiceGatewayHandle {
            url: websocket_url.to_string(),
            events: shared_events,
            websocket_send: shared_websocket_send.clone(),
            kill_send: kill_send.clone(),
        })
    }

    /// The main gateway listener task;
    async fn gateway_listen_task(&mut self) {
        loop {
            let msg;

            tokio::select! {
                Ok(_) = self.kill_receive.recv() => {
                    trace!("VGW: Closing listener task");
                    break;
                }
                message = self.websocket_receive.next() => {
                    msg = message;
                }
            }

            // Note: The tungstenite backend handles close codes as messages
            if let Some(Ok(message)) = msg {
                match message.into() {
                    VoiceGatewayCommunication::Message(message) => {
                        self.handle_message(message).await
                    }
                    VoiceGatewayCommunication::Binary(binary) => {
                        self.handle_binary(binary.0).await
                    }
                    VoiceGatewayCommunication::Error(close_code) => {
                        self.handle_close_code(close_code).await
                    }
                }

                continue;
            }

            // We couldn't receive the next message or it was an error, something is wrong with the websocket, close
            warn!("VGW: Websocket is broken, stopping gateway");
            break;
        }
    }

    /// Closes the websocket connection and stops all tasks
    async fn close(&mut self) {
        let _ = self.kill_send.send(());
        let _ = futures_util::SinkExt::close(&mut *self.websocket_send.lock().await).await;
    }

    /// Handles receiving a [VoiceCloseCode].
    ///
    /// Closes the connection and publishes an error event.
    async fn handle_close_code(&mut self, code: VoiceCloseCode) {
        let error = VoiceGatewayError::from(code);

        warn!("VGW: Received error {:?}, connection will close..", error);
        self.close().await;
        self.events.lock().await.error.publish(error).await;
    }

    /// Deserializes and publishes a dispatched event, when we already know its type;
    /// (Called for every event in handle_message)
    async fn handle_event<'a, T: WebSocketEvent + serde::Deserialize<'a>>(
        data: &'a str,
        event: &mut Publisher<T>,
    ) -> Result<(), serde_json::Error> {
        let data_deserialize_result: Result<T, serde_json::Error> = serde_json::from_str(data);
        event.publish(data_deserialize_result?).await;
        Ok(())
    }

    /// Handles a binary websocket frame: a DAVE MLS message.
    async fn handle_binary(&mut self, data: Vec<u8>) {
        let Some(dave_message) = DaveBinaryMessage::parse(&data) else {
            warn!("VGW: Received a binary frame too short to be a DAVE message");
            return;
        };

        // Binary frames also carry a sequence number we need to ack
        self.update_seq_ack(i32::from(dave_message.seq)).await;

        trace!(
            "VGW: Received DAVE binary frame, opcode {}",
            dave_message.op_code
        );
        self.events
            .lock()
            .await
            .dave_binary
            .publish(dave_message)
            .await;
    }

    /// Tells the heartbeat task about a newly seen sequence number.
    async fn update_seq_ack(&self, seq_ack: i32) {
        let _ = self
            .heartbeat_handler
            .send
            .send(VoiceHeartbeatTaskCommunication {
                updated_seq_ack: Some(seq_ack),
                op_code: None,
            })
            .await;
    }

    /// This handles a message as a websocket event and publishes it
    pub async fn handle_message(&mut self, msg: VoiceGatewayMessage) {
        if msg.0.is_empty() {
            return;
        }

        let Ok(gateway_payload) = msg.payload() else {
            warn!("VGW: Message unrecognised: {:?}", msg.0);
            return;
        };

        if let Some(seq) = gateway_payload.seq {
            self.update_seq_ack(seq).await;
        }

        // See <https://discord.com/developers/docs/topics/voice-connections>
        match gateway_payload.op_code {
            VOICE_READY => {
                trace!("VGW: Received READY!");

                let event = &mut self.events.lock().await.voice_ready;
                let result = VoiceGateway::handle_event(gateway_payload.data.get(), event).await;
                if let Err(e) = result {
                    warn!("Failed to parse VOICE_READY ({e})");
                }
            }
            VOICE_SESSION_DESCRIPTION => {
                trace!("VGW: Received Session Description");

                let event = &mut self.events.lock().await.session_description;
                let result = VoiceGateway::handle_event(gateway_payload.data.get(), event).await;
                if let Err(e) = result {
                    warn!("Failed to parse VOICE_SESSION_DESCRIPTION ({e})");
                }
            }
            VOICE_SPEAKING => {
                trace!("VGW: Received Speaking");

                let event = &mut self.events.lock().await.speaking;
                let result = VoiceGateway::handle_event(gateway_payload.data.get(), event).await;
                if let Err(e) = result {
                    warn!("Failed to parse VOICE_SPEAKING ({e})");
                }
            }
            VOICE_MULTIPLE_CLIENTS_CONNECT => {
                trace!("VGW: Received Multiple Clients Connect");

                let event = &mut self.events.lock().await.client_connect;
                let result = VoiceGateway::handle_event(gateway_payload.data.get(), event).await;
                if let Err(e) = result {
                    warn!("Failed to parse VOICE_MULTIPLE_CLIENTS_CONNECT ({e})");
                }
            }
            VOICE_CLIENT_DISCONNECT => {
                trace!("VGW: Received Client Disconnect");

                let event = &mut self.events.lock().await.client_disconnect;
                let result = VoiceGateway::handle_event(gateway_payload.data.get(), event).await;
                if let Err(e) = result {
                    warn!("Failed to parse VOICE_CLIENT_DISCONNECT ({e})");
                }
            }
            VOICE_RESUMED => {
                trace!("VGW: Received Resumed");
                // Nothing to do, the connection continues with existing state
            }
            VOICE_DAVE_PREPARE_TRANSITION => {
                trace!("VGW: Received DAVE Prepare Transition");

                let event = &mut self.events.lock().await.dave_prepare_transition;
                let result = VoiceGateway::handle_event(gateway_payload.data.get(), event).await;
                if let Err(e) = result {
                    warn!("Failed to parse VOICE_DAVE_PREPARE_TRANSITION ({e})");
                }
            }
            VOICE_DAVE_EXECUTE_TRANSITION => {
                trace!("VGW: Received DAVE Execute Transition");

                let event = &mut self.events.lock().await.dave_execute_transition;
                let result = VoiceGateway::handle_event(gateway_payload.data.get(), event).await;
                if let Err(e) = result {
                    warn!("Failed to parse VOICE_DAVE_EXECUTE_TRANSITION ({e})");
                }
            }
            VOICE_DAVE_PREPARE_EPOCH => {
                trace!("VGW: Received DAVE Prepare Epoch");

                let event = &mut self.events.lock().await.dave_prepare_epoch;
                let result = VoiceGateway::handle_event(gateway_payload.data.get(), event).await;
                if let Err(e) = result {
                    warn!("Failed to parse VOICE_DAVE_PREPARE_EPOCH ({e})");
                }
            }
            VOICE_DAVE_MLS_INVALID_COMMIT_WELCOME => {
                // We only ever send this; receiving it means the server
                // rejected our signal, nothing further to do
                trace!("VGW: Received DAVE Invalid Commit Welcome");
            }
            // We received a heartbeat from the server
            // "Discord may send the app a Heartbeat (opcode 3) event, in which case the app should send a Heartbeat event immediately."
            VOICE_HEARTBEAT => {
                trace!("VGW: Received Heartbeat // Heartbeat Request");

                // Tell the heartbeat handler it should send a heartbeat right away
                let heartbeat_communication = VoiceHeartbeatTaskCommunication {
                    updated_seq_ack: None,
                    op_code: Some(VOICE_HEARTBEAT),
                };

                self.heartbeat_handler
                    .send
                    .send(heartbeat_communication)
                    .await
                    .unwrap();
            }
            VOICE_HEARTBEAT_ACK => {
                trace!("VGW: Received Heartbeat ACK");

                // Tell the heartbeat handler we received an ack
                let heartbeat_communication = VoiceHeartbeatTaskCommunication {
                    updated_seq_ack: None,
                    op_code: Some(VOICE_HEARTBEAT_ACK),
                };

                self.heartbeat_handler
                    .send
                    .send(heartbeat_communication)
                    .await
                    .unwrap();
            }
            VOICE_IDENTIFY | VOICE_SELECT_PROTOCOL | VOICE_RESUME => {
                info!(
                    "VGW: Received unexpected opcode ({}) for current state. This might be due to a faulty server implementation.",
                    gateway_payload.op_code
                );
            }
            _ => {
                warn!(
                    "VGW: Received unrecognized voice gateway op code ({})",
                    gateway_payload.op_code
                );
            }
        }
    }
}
