// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#[cfg(not(target_arch = "wasm32"))]
pub mod tokio;
#[cfg(not(target_arch = "wasm32"))]
pub use tokio::*;

#[cfg(not(target_arch = "wasm32"))]
pub type UdpSocket = tokio::TokioSocket;
#[cfg(not(target_arch = "wasm32"))]
pub type UdpBackend = tokio::TokioBackend;
