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

use std::{fs, path::PathBuf, time::Duration};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::consts;

/// Read a server config from an explicit path, falling back to
/// `~/.config/fleetctl/server.toml`, then to defaults, the same
/// precedence `libshpool::config::read_config` uses.
#[instrument(skip_all)]
pub fn read_server_config(config_file: &Option<String>) -> anyhow::Result<ServerConfig> {
    let raw = read_raw(config_file, "server.toml")?;
    let config: ServerConfig = match raw {
        Some(s) => toml::from_str(&s).context("parsing server config file")?,
        None => ServerConfig::default(),
    };
    Ok(config)
}

#[instrument(skip_all)]
pub fn read_agent_config(config_file: &Option<String>) -> anyhow::Result<AgentConfig> {
    let raw = read_raw(config_file, "agent.toml")?;
    let config: AgentConfig = match raw {
        Some(s) => toml::from_str(&s).context("parsing agent config file")?,
        None => AgentConfig::default(),
    };
    Ok(config)
}

fn read_raw(config_file: &Option<String>, default_name: &str) -> anyhow::Result<Option<String>> {
    if let Some(path) = config_file {
        info!("parsing explicitly passed in config ({})", path);
        let s = fs::read_to_string(path).context("reading config toml")?;
        return Ok(Some(s));
    }

    if let Some(home) = dirs_home() {
        let path: PathBuf = [home.as_str(), ".config", "fleetctl", default_name].iter().collect();
        if path.exists() {
            let s = fs::read_to_string(&path).context("reading config toml")?;
            return Ok(Some(s));
        }
    }

    Ok(None)
}

fn dirs_home() -> Option<String> {
    std::env::var("HOME").ok()
}

/// Top level server configuration: which transports to listen on, where
/// the content root lives, and the tunable intervals named throughout
/// spec §4-§5.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port to accept agent connections on, e.g. `Some(4242)`.
    pub tcp_port: Option<u16>,
    /// Unix-domain socket paths to listen on.
    pub unix_sockets: Vec<String>,
    /// Unix sockets to dial out to (one per VM serial device) rather
    /// than listen on.
    pub dialed_unix_sockets: Vec<String>,
    /// Root directory for servable content and recorded responses.
    pub content_root: String,
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_secs")]
    pub reaper_interval: Duration,
    pub file_chunk_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            tcp_port: Some(4242),
            unix_sockets: Vec::new(),
            dialed_unix_sockets: Vec::new(),
            content_root: "/var/lib/fleetctl".to_string(),
            heartbeat_interval: consts::DEFAULT_HEARTBEAT_INTERVAL,
            reaper_interval: consts::DEFAULT_REAPER_INTERVAL,
            file_chunk_size: consts::DEFAULT_FILE_CHUNK_SIZE,
        }
    }
}

/// Agent-side configuration.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AgentConfig {
    /// `host:port` of the server's TCP transport, or a `unix:` prefixed
    /// path to dial a unix socket instead.
    pub server_addr: String,
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    /// Override the UUID the agent advertises (mostly for tests); by
    /// default a fresh v4 UUID is generated on first run and persisted.
    pub uuid: Option<String>,
    pub tags: std::collections::HashMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            server_addr: "127.0.0.1:4242".to_string(),
            heartbeat_interval: consts::DEFAULT_HEARTBEAT_INTERVAL,
            uuid: None,
            tags: std::collections::HashMap::new(),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
