// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#[cfg(not(target_arch = "wasm32"))]
pub mod tungstenite;
#[cfg(not(target_arch = "wasm32"))]
pub use tungstenite::*;

#[cfg(not(target_arch = "wasm32"))]
pub type Sink = tungstenite::TungsteniteSink;
#[cfg(not(target_arch = "wasm32"))]
pub type Stream = tungstenite::TungsteniteStream;
#[cfg(not(target_arch = "wasm32"))]
pub type WebSocketBackend = tungstenite::TungsteniteBackend;
