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

use fleetc_protocol::CodecError;

/// The error kinds named in spec §7. Most of the core propagates
/// `anyhow::Error` with `.context(...)` the way `libshpool` does, but
/// these specific kinds get matched on programmatically by callers (the
/// connection handler decides whether to log-and-close vs. log-and-drop
/// based on which one it got), so they get a real enum instead of living
/// only in an error string.
#[derive(thiserror::Error, Debug)]
pub enum FleetError {
    #[error("peer closed the connection cleanly")]
    TransportEof,

    #[error("connection reset by peer")]
    TransportReset,

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("unknown client: {0}")]
    UnknownClient(String),

    #[error("unknown command: {0}")]
    UnknownCommand(u64),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("refusing to transfer a directory: {0}")]
    FileIsDir(String),

    #[error("file io error on {path}: {source}")]
    FileIo { path: String, #[source] source: std::io::Error },

    #[error("tunnel setup failed: {0}")]
    TunnelSetup(String),

    #[error("a client with uuid {0} is already registered")]
    RegistryConflict(String),

    #[error("peer protocol version mismatch: local={local} peer={peer}")]
    VersionMismatch { local: String, peer: String },

    #[error("invalid filter: {0}")]
    InvalidFilter(String),
}

impl From<CodecError> for FleetError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::TransportEof => FleetError::TransportEof,
            CodecError::TransportReset => FleetError::TransportReset,
            other => FleetError::Decode(other.to_string()),
        }
    }
}
