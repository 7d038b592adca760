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

/// fleetc-agent runs inside a managed VM/container: it dials the
/// server, advertises its identity, executes dispatched commands, and
/// streams results back on every heartbeat.
use std::{net::TcpStream, sync::Arc, thread, time::Duration};

use clap::Parser;
use fleetc_core::{agent::AgentState, config, consts, transport::{self, DuplexStream}};
use fleetc_protocol::{decode_from, encode_to, ClientInfo, Message};
use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, prelude::*, reload};

#[derive(Parser, Debug)]
#[clap(author, about)]
struct Args {
    #[clap(short, long, action = clap::ArgAction::Count, help = "Show more in logs, may be provided multiple times")]
    verbose: u8,

    #[clap(short, long, action, help = "A toml file containing agent configuration")]
    config_file: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let (filter, log_level_handle) = reload::Layer::new(level);
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();

    let config = config::read_agent_config(&args.config_file)?;
    let uuid = config.uuid.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let hostname = hostname_best_effort();

    let identity = ClientInfo {
        uuid: uuid.clone(),
        hostname,
        arch: std::env::consts::ARCH.to_string(),
        os: std::env::consts::OS.to_string(),
        version: fleetc_protocol::VERSION.to_string(),
        tags: config.tags.clone(),
        ..Default::default()
    };
    let state = Arc::new(AgentState::new(identity, Some(log_level_handle)));

    loop {
        match connect_once(&config.server_addr, &state, config.heartbeat_interval) {
            Ok(()) => info!("connection closed cleanly, reconnecting"),
            Err(e) => warn!(error = %e, "connection failed, reconnecting"),
        }
        thread::sleep(fleetc_core::consts::DIAL_RETRY_INTERVAL);
    }
}

fn connect_once(server_addr: &str, state: &Arc<AgentState>, heartbeat_interval: Duration) -> anyhow::Result<()> {
    let mut stream: Box<dyn DuplexStream> = dial(server_addr)?;
    transport::exchange_version_header(stream.as_mut())?;

    let mut reader: Box<dyn DuplexStream> = stream.try_clone_box()?;
    let mut write_half = stream;

    // A single shared outbound queue, drained by one writer thread, so
    // the initial handshake, heartbeats, and named-pipe stdout/stderr
    // forwarding never race each other on the socket.
    let (outbound_tx, outbound_rx) = crossbeam_channel::bounded::<Message>(consts::OUTBOUND_QUEUE_DEPTH);
    state.set_outbound(outbound_tx.clone());
    let writer = thread::spawn(move || {
        for msg in outbound_rx.iter() {
            if encode_to(&msg, write_half.as_mut()).is_err() {
                break;
            }
        }
    });

    let (identity, _) = state.drain_heartbeat_payload();
    outbound_tx
        .send(Message::Client { uuid: Some(identity.uuid.clone()), error: String::new(), client: identity, responses: Vec::new() })
        .map_err(|_| anyhow::anyhow!("outbound queue closed before handshake could be sent"))?;

    let heartbeat_state = Arc::clone(state);
    let heartbeat_tx = outbound_tx.clone();
    // detached: it exits on its own once the outbound queue closes,
    // which happens naturally when the writer thread above exits.
    let _heartbeat_thread = thread::spawn(move || loop {
        thread::sleep(heartbeat_interval);
        let (identity, responses) = heartbeat_state.drain_heartbeat_payload();
        let msg = Message::Client { uuid: Some(identity.uuid.clone()), error: String::new(), client: identity, responses };
        if heartbeat_tx.send(msg).is_err() {
            break;
        }
    });

    let result = loop {
        let msg: Message = match decode_from(reader.as_mut()) {
            Ok(m) => m,
            Err(e) => break Err(e.into()),
        };
        match msg {
            Message::Command { commands, .. } => {
                state.execute_batch(commands);
            }
            Message::Client { client, .. } => {
                state.adopt_namespace(client.namespace);
            }
            Message::Pipe { pipe, .. } => {
                state.handle_pipe_frame(pipe);
            }
            Message::Heartbeat { .. } => {}
            other => {
                tracing::debug!(ty = other.type_name(), "ignoring message type not yet handled by the agent");
            }
        }
    };

    drop(reader);
    drop(outbound_tx);
    let _ = writer.join();
    result
}

fn dial(server_addr: &str) -> anyhow::Result<Box<dyn DuplexStream>> {
    #[cfg(unix)]
    if let Some(path) = server_addr.strip_prefix("unix:") {
        let stream = std::os::unix::net::UnixStream::connect(path)?;
        return Ok(Box::new(stream));
    }
    let stream = TcpStream::connect(server_addr)?;
    Ok(Box::new(stream))
}

fn hostname_best_effort() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
