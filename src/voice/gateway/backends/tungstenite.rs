// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use futures_util::{
    stream::{SplitSink, SplitStream},
    StreamExt,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async_tls_with_config, tungstenite, Connector, MaybeTlsStream, WebSocketStream,
};

use crate::errors::VoiceGatewayError;
use crate::types::VoiceCloseCode;
use crate::voice::gateway::{
    VoiceGatewayBinaryMessage, VoiceGatewayCommunication, VoiceGatewayMessage,
};

#[derive(Debug, Clone)]
pub struct TungsteniteBackend;

pub type TungsteniteSink =
    SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>;
pub type TungsteniteStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

impl TungsteniteBackend {
    pub async fn connect(
        websocket_url: &str,
    ) -> Result<(TungsteniteSink, TungsteniteStream), VoiceGatewayError> {
        let mut roots = rustls::RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));

        let (websocket_stream, _) = match connect_async_tls_with_config(
            websocket_url,
            None,
            false,
            Some(Connector::Rustls(
                rustls::ClientConfig::builder()
                    .with_safe_defaults()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
                    .into(),
            )),
        )
        .await
        {
            Ok(websocket_stream) => websocket_stream,
            Err(e) => {
                return Err(VoiceGatewayError::CannotConnect {
                    error: e.to_string(),
                })
            }
        };

        Ok(websocket_stream.split())
    }
}

impl From<VoiceGatewayMessage> for tungstenite::Message {
    fn from(message: VoiceGatewayMessage) -> Self {
        Self::Text(message.0)
    }
}

impl From<VoiceGatewayBinaryMessage> for tungstenite::Message {
    fn from(message: VoiceGatewayBinaryMessage) -> Self {
        Self::Binary(message.0)
    }
}

impl From<tungstenite::Message> for VoiceGatewayCommunication {
    fn from(value: tungstenite::Message) -> Self {
        match value {
            tungstenite::Message::Text(text) => {
                VoiceGatewayCommunication::Message(VoiceGatewayMessage(text))
            }
            tungstenite::Message::Binary(bytes) => {
                VoiceGatewayCommunication::Binary(VoiceGatewayBinaryMessage(bytes))
            }
            tungstenite::Message::Close(close_frame) => {
                if close_frame.is_none() {
                    // Note: there is no unknown error. This case shouldn't happen, so I'm just
                    // going to delegate it to this error
                    return VoiceGatewayCommunication::Error(VoiceCloseCode::FailedToDecodePayload);
                }

                let close_code = u16::from(close_frame.unwrap().code);

                VoiceGatewayCommunication::Error(
                    VoiceCloseCode::try_from(close_code)
                        .unwrap_or(VoiceCloseCode::FailedToDecodePayload),
                )
            }
            _ => VoiceGatewayCommunication::Error(VoiceCloseCode::FailedToDecodePayload),
        }
    }
}
