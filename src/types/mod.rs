// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Wire payload types shared across the voice gateway and UDP modules.

mod snowflake;
pub mod voice_gateway;

pub use snowflake::Snowflake;
pub use voice_gateway::*;

/// Marker trait for everything that can travel over (or describe the state
/// of) the voice websocket connection.
pub trait WebSocketEvent: Send + Sync + std::fmt::Debug {}
