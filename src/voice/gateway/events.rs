// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use pubserve::Publisher;

use crate::{
    errors::VoiceGatewayError,
    types::{
        DaveBinaryMessage, DaveExecuteTransition, DavePrepareEpoch, DavePrepareTransition,
        SessionDescription, Speaking, VoiceClientConnect, VoiceClientDisconnection, VoiceReady,
    },
};

/// The deserialized events the voice gateway connection publishes.
#[derive(Default, Debug)]
pub struct VoiceEvents {
    pub voice_ready: Publisher<VoiceReady>,
    pub session_description: Publisher<SessionDescription>,
    pub speaking: Publisher<Speaking>,
    pub client_connect: Publisher<VoiceClientConnect>,
    pub client_disconnect: Publisher<VoiceClientDisconnection>,
    pub dave_prepare_transition: Publisher<DavePrepareTransition>,
    pub dave_execute_transition: Publisher<DaveExecuteTransition>,
    pub dave_prepare_epoch: Publisher<DavePrepareEpoch>,
    /// The binary MLS frames (external sender, proposals, commits, welcome)
    pub dave_binary: Publisher<DaveBinaryMessage>,
    pub error: Publisher<VoiceGatewayError>,
}
