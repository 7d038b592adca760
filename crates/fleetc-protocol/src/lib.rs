// Copyright 2025 Fleetctl Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire types and framing shared between the fleetctl server and agent.
//!
//! The layout mirrors `shpool-protocol`: bare serde structs and enums with
//! no behavior attached, plus a couple of small ext traits (see
//! [`codec`]) for the byte-level framing. Anything that needs real logic
//! (dispatch, registries, transports) lives in `fleetc-core`.

mod codec;
mod message;

pub use codec::{decode_from, encode_to, CodecError};
pub use message::*;

/// Protocol version advertised by both peers on connect. A mismatch is a
/// warning, never a hard failure (spec: VERSION_MISMATCH is non-fatal).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The first thing either peer writes to a freshly opened transport.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct VersionHeader {
    pub version: String,
}
