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

//! Ties the registry, command store, dispatcher, response handler, and
//! tunnel/UFS planes together into the per-connection handshake and
//! message loop described by spec §4.3 and the task set in §5.

use std::{
    sync::{atomic::AtomicBool, Arc},
    thread,
};

use fleetc_protocol::{decode_from, ClientInfo, Message};
use tracing::{debug, info, instrument, warn};

use crate::{
    dispatcher::Dispatcher,
    error::FleetError,
    file_transfer,
    pipe::PipeHub,
    registry::Registry,
    response::ResponseHandler,
    transport::{self, DuplexStream},
    tunnel::{self, TunnelMux, TunnelSink},
    ufs::UfsChannel,
    uuidnorm,
    vm_registry::VmRegistry,
};

/// Everything a connection handler needs, assembled once at server
/// startup and cloned (cheaply — every field is `Arc`/`Clone`-cheap)
/// into each per-connection thread.
#[derive(Clone)]
pub struct Server {
    pub registry: Registry,
    pub dispatcher: Dispatcher,
    pub response_handler: ResponseHandler,
    pub vm_registry: Arc<dyn VmRegistry>,
    pub content_root: std::path::PathBuf,
    pub file_chunk_size: usize,
}

impl Server {
    /// Accept and run one client connection to completion. Never
    /// returns an `Err` upward beyond logging it: per spec §5, a single
    /// client's transport error must never affect any other client.
    #[instrument(skip_all)]
    pub fn handle_connection(&self, mut stream: Box<dyn DuplexStream>) {
        if let Err(e) = transport::exchange_version_header(stream.as_mut()) {
            debug!(error = %e, "version handshake failed, dropping connection");
            return;
        }

        let (uuid, namespace) = match self.handshake(stream.as_mut()) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "handshake failed, dropping connection");
                return;
            }
        };

        let (outbound_tx, outbound_rx) = crossbeam_channel::bounded::<Message>(crate::consts::OUTBOUND_QUEUE_DEPTH);
        let prior = self.registry.insert(
            ClientInfo { uuid: uuid.clone(), namespace: namespace.clone(), ..Default::default() },
            outbound_tx.clone(),
        );
        if prior.is_some() {
            info!(uuid, "evicted a stale registration for the same uuid on reconnect");
        }

        // Echo the handshake back once the namespace is resolved (spec
        // §4.3 step 3 / §2): the agent needs this to learn the
        // namespace the VM registry assigned it.
        let echo = Message::Client {
            uuid: Some(uuid.clone()),
            error: String::new(),
            client: ClientInfo { uuid: uuid.clone(), namespace: namespace.clone(), ..Default::default() },
            responses: Vec::new(),
        };
        if outbound_tx.send(echo).is_err() {
            warn!(uuid, "failed to queue handshake echo, client likely already gone");
        }

        let mux = TunnelMux::new(TunnelSink::new(uuid.clone(), outbound_tx.clone()));
        let ufs = Arc::new(UfsChannel::new(uuid.clone(), outbound_tx.clone()));
        let pipes = Arc::new(PipeHub::new(uuid.clone(), outbound_tx));

        let mut write_half = match stream.try_clone_box() {
            Ok(w) => w,
            Err(e) => {
                warn!(uuid, error = %e, "failed to clone connection for writer thread");
                self.registry.remove(&uuid);
                return;
            }
        };
        if let Ok(shutdown_handle) = stream.try_clone_box() {
            self.registry.attach_resources(&uuid, Arc::clone(&mux), Arc::clone(&ufs), Arc::clone(&pipes), shutdown_handle);
        }

        // the full command set, filtered, goes out immediately per
        // spec §4.3 step 5
        self.dispatcher.dispatch_to(&uuid);

        let writer = thread::spawn(move || {
            for msg in outbound_rx.iter() {
                if fleetc_protocol::encode_to(&msg, write_half.as_mut()).is_err() {
                    break;
                }
            }
        });

        let mut uploads = std::collections::HashMap::new();
        self.read_loop(stream.as_mut(), &uuid, &mux, &ufs, &pipes, &mut uploads);

        self.registry.remove(&uuid);
        let _ = writer.join();
        info!(uuid, "client disconnected and removed from registry");
    }

    fn handshake(&self, stream: &mut dyn DuplexStream) -> Result<(String, String), FleetError> {
        let first: Message = decode_from(&mut *stream)?;
        let Message::Client { client, .. } = first else {
            return Err(FleetError::Decode("first message on a new connection must be CLIENT".to_string()));
        };

        let canonical = uuidnorm::canonicalize(&client.uuid);
        let handle = match self.vm_registry.lookup(&canonical) {
            Some(h) => h,
            None => match uuidnorm::unmangle(&canonical).and_then(|u| self.vm_registry.lookup(&u)) {
                Some(h) => h,
                None => return Err(FleetError::UnknownClient(client.uuid.clone())),
            },
        };
        let namespace = handle.get_namespace();
        Ok((canonical, namespace))
    }

    fn read_loop(
        &self,
        stream: &mut dyn DuplexStream,
        uuid: &str,
        mux: &Arc<TunnelMux>,
        ufs: &Arc<UfsChannel>,
        pipes: &Arc<PipeHub>,
        uploads: &mut std::collections::HashMap<u64, file_transfer::ChunkReceiver>,
    ) {
        loop {
            let msg: Message = match decode_from(&mut *stream) {
                Ok(m) => m,
                Err(e) => {
                    let err = FleetError::from(e);
                    match err {
                        FleetError::TransportEof => debug!(uuid, "client closed connection"),
                        other => info!(uuid, error = %other, "transport error, closing connection"),
                    }
                    return;
                }
            };
            self.dispatch_inbound(uuid, msg, mux, ufs, pipes, uploads);
        }
    }

    fn dispatch_inbound(
        &self,
        uuid: &str,
        msg: Message,
        mux: &Arc<TunnelMux>,
        ufs: &Arc<UfsChannel>,
        pipes: &Arc<PipeHub>,
        uploads: &mut std::collections::HashMap<u64, file_transfer::ChunkReceiver>,
    ) {
        match msg {
            Message::Client { client, responses, .. } => {
                self.response_handler.handle_client_message(&client, &responses);
                self.dispatcher.dispatch_to(uuid);
            }
            Message::Heartbeat { .. } => {
                self.registry.with(uuid, |c| c.touch());
                self.dispatcher.dispatch_to(uuid);
            }
            Message::Tunnel { data, .. } => {
                if let Err(e) = tunnel::on_tunnel_message(mux, &data) {
                    warn!(uuid, error = %e, "bad tunnel frame");
                }
            }
            Message::Ufs { ufs: frame, .. } => {
                ufs.on_frame(frame);
            }
            Message::Pipe { pipe, .. } => {
                pipes.on_frame(pipe);
            }
            Message::File { file, .. } => {
                self.handle_incoming_file_chunk(uuid, file, uploads);
            }
            Message::Command { .. } => {
                debug!(uuid, ty = msg.type_name(), "message type not expected from an agent, ignoring");
            }
        }
    }

    fn handle_incoming_file_chunk(
        &self,
        uuid: &str,
        chunk: fleetc_protocol::FileChunk,
        uploads: &mut std::collections::HashMap<u64, file_transfer::ChunkReceiver>,
    ) {
        let dest = self.content_root.join("uploads").join(uuid);
        let receiver = uploads.entry(chunk.id).or_insert_with(|| file_transfer::ChunkReceiver::new(dest));
        match receiver.accept(&chunk) {
            Ok(true) => {
                uploads.remove(&chunk.id);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(uuid, error = %e, "failed to persist incoming file chunk");
                uploads.remove(&chunk.id);
            }
        }
    }
}
