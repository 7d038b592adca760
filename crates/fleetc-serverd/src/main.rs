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

/// fleetc-serverd accepts agent connections over TCP and/or unix
/// sockets, holding the single registry/command-store/dispatcher the
/// whole fleet shares. See the README for more info.
use std::sync::{atomic::AtomicBool, Arc};

use clap::Parser;
use fleetc_core::{
    command::CommandStore, config, dispatcher::Dispatcher, reaper, registry::Registry,
    response::ResponseHandler, server::Server, transport, vm_registry::InMemoryVmRegistry,
};
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, reload};

#[derive(Parser, Debug)]
#[clap(author, about)]
struct Args {
    #[clap(short, long, action = clap::ArgAction::Count, help = "Show more in logs, may be provided multiple times")]
    verbose: u8,

    #[clap(short, long, action, help = "A toml file containing server configuration")]
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

    let config = config::read_server_config(&args.config_file)?;

    let registry = Registry::new();
    let commands = Arc::new(CommandStore::new());
    let dispatcher = Dispatcher::new(registry.clone(), commands.clone());
    let vm_registry = Arc::new(InMemoryVmRegistry::new());
    let response_handler =
        ResponseHandler::new(registry.clone(), commands.clone(), vm_registry.clone(), config.content_root.clone());

    let server = Server {
        registry: registry.clone(),
        dispatcher: dispatcher.clone(),
        response_handler,
        vm_registry,
        content_root: config.content_root.clone().into(),
        file_chunk_size: config.file_chunk_size,
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let _broadcast = fleetc_core::dispatcher::spawn_broadcast_thread(dispatcher, config.heartbeat_interval, shutdown.clone());
    let _reaper = reaper::spawn(registry, config.reaper_interval, shutdown.clone());
    let shutdown_for_dials = shutdown.clone();

    let _ = log_level_handle.modify(|f| *f = level);

    let mut handles = Vec::new();
    if let Some(port) = config.tcp_port {
        let listener = transport::listen_tcp(port)?;
        info!(port, "listening on tcp");
        let server = server.clone();
        handles.push(std::thread::spawn(move || {
            transport::serve_tcp(listener, move |stream| server.handle_connection(stream));
        }));
    }
    #[cfg(unix)]
    for path in &config.unix_sockets {
        let listener = transport::listen_unix(std::path::Path::new(path))?;
        info!(path, "listening on unix socket");
        let server = server.clone();
        handles.push(std::thread::spawn(move || {
            transport::serve_unix(listener, move |stream| server.handle_connection(stream));
        }));
    }

    #[cfg(unix)]
    for path in &config.dialed_unix_sockets {
        let path = std::path::PathBuf::from(path);
        info!(path = %path.display(), "dialing unix socket");
        let server = server.clone();
        let dial_shutdown = shutdown_for_dials.clone();
        handles.push(std::thread::spawn(move || {
            transport::dial_unix_loop(path, dial_shutdown, move |stream| server.handle_connection(stream));
        }));
    }

    if handles.is_empty() {
        error!("no transports configured, nothing to do");
        return Ok(());
    }

    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}
