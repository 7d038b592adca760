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

use std::collections::{BTreeMap, HashMap};

use serde_derive::{Deserialize, Serialize};

/// A single dispatch unit. The `id` is assigned by the server; agents
/// never see a command before it has one.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Command {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub filter: Option<Filter>,
    /// Ordered argv to execute. Empty means this command carries only a
    /// signal/kill/loglevel/file/pipe operation.
    #[serde(default)]
    pub argv: Vec<String>,
    /// If true, the agent does not wait for completion before acking.
    #[serde(default)]
    pub background: bool,
    /// Nonzero sends the process group a terminate signal. -1 means "all".
    #[serde(default)]
    pub pid: i64,
    /// Name prefix; nonempty means "kill every child process whose command
    /// name starts with this".
    #[serde(default)]
    pub killall: String,
    #[serde(default)]
    pub level: Option<LogLevel>,
    /// Paths the server should push to the agent before execution.
    #[serde(default)]
    pub files_send: Vec<String>,
    /// Paths the agent should pull back to the server after execution.
    #[serde(default)]
    pub files_recv: Vec<String>,
    /// Opaque operator tag, never interpreted by the core.
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
}

/// A predicate constraining which agents a command applies to. A filter
/// whose every field is empty matches every client (spec §3/§4.5).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Filter {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    /// A literal IP or a CIDR block.
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.uuid.is_none()
            && self.hostname.is_none()
            && self.arch.is_none()
            && self.os.is_none()
            && self.ip.is_none()
            && self.mac.is_none()
            && self.tags.is_empty()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// The identity and liveness state an agent reports, both at handshake
/// time (as a `Client` message) and on every heartbeat.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ClientInfo {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub macs: Vec<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Assigned by the VM registry; read-only as far as the agent is
    /// concerned, round-tripped here so the daemon can echo it back.
    #[serde(default)]
    pub namespace: String,
    /// The agent's local idea of how many commands it has ever seen,
    /// used by the response handler to resynchronize the server's
    /// counter after a restart (spec §4.7).
    #[serde(default)]
    pub command_counter: u64,
}

/// A completed command's captured output, sent back on the next
/// heartbeat.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Response {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub stdout: Vec<u8>,
    #[serde(default)]
    pub stderr: Vec<u8>,
    #[serde(default)]
    pub files: Vec<ResponseFile>,
}

/// A whole file captured on the client and shipped back inline with a
/// response (as opposed to the chunked [`FileChunk`] transport used for
/// `files_send`/`files_recv`/file-get).
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ResponseFile {
    #[serde(default)]
    pub rel_path: String,
    #[serde(default)]
    pub perm: u32,
    #[serde(default)]
    pub data: Vec<u8>,
}

/// One chunk of a file in flight, in either direction. The logical file
/// is the ordered concatenation of chunks sharing `id` and `name`, with
/// permissions taken from the first chunk (spec §3).
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct FileChunk {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub perm: u32,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub eof: bool,
}

/// Control/data frame for the named-pipe stdio routing feature.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PipeFrame {
    pub name: String,
    pub mode: PipeMode,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeMode {
    Open,
    Data,
    Close,
}

/// Control/data frame for the UFS plane. Bytes are opaque to the core;
/// only the 9P-ish service riding on top interprets them.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UfsFrame {
    pub mode: UfsMode,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UfsMode {
    Open,
    Data,
    Close,
}

/// The top level tagged union every byte stream on the wire carries.
///
/// Every variant embeds `uuid` (the target when server-originated, the
/// origin when agent-originated) and `error` (nonempty iff the peer
/// cannot satisfy the request) per spec §4.1. `Heartbeat` is a
/// zero-payload liveness ping distinct from a `Client` message proper
/// (which is what carries the full identity/response sync described in
/// the glossary's "Heartbeat" entry) — see DESIGN.md for why the two
/// wire types coexist.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Message {
    Command {
        uuid: Option<String>,
        #[serde(default)]
        error: String,
        commands: BTreeMap<u64, Command>,
    },
    Client {
        uuid: Option<String>,
        #[serde(default)]
        error: String,
        client: ClientInfo,
        #[serde(default)]
        responses: Vec<Response>,
    },
    Tunnel {
        uuid: Option<String>,
        #[serde(default)]
        error: String,
        data: Vec<u8>,
    },
    File {
        uuid: Option<String>,
        #[serde(default)]
        error: String,
        file: FileChunk,
    },
    Pipe {
        uuid: Option<String>,
        #[serde(default)]
        error: String,
        pipe: PipeFrame,
    },
    Ufs {
        uuid: Option<String>,
        #[serde(default)]
        error: String,
        ufs: UfsFrame,
    },
    Heartbeat {
        uuid: Option<String>,
        #[serde(default)]
        error: String,
    },
}

impl Message {
    pub fn uuid(&self) -> Option<&str> {
        match self {
            Message::Command { uuid, .. }
            | Message::Client { uuid, .. }
            | Message::Tunnel { uuid, .. }
            | Message::File { uuid, .. }
            | Message::Pipe { uuid, .. }
            | Message::Ufs { uuid, .. }
            | Message::Heartbeat { uuid, .. } => uuid.as_deref(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Command { .. } => "COMMAND",
            Message::Client { .. } => "CLIENT",
            Message::Tunnel { .. } => "TUNNEL",
            Message::File { .. } => "FILE",
            Message::Pipe { .. } => "PIPE",
            Message::Ufs { .. } => "UFS",
            Message::Heartbeat { .. } => "HEARTBEAT",
        }
    }

    pub fn err(uuid: Option<String>, msg: impl Into<String>) -> Message {
        Message::File { uuid, error: msg.into(), file: FileChunk::default() }
    }
}
