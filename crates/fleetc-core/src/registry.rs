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

//! The client registry (spec §4.3): the server's live view of every
//! connected agent, and the handshake that admits a new one.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use fleetc_protocol::{ClientInfo, Message};
use tracing::{debug, info, instrument};

use crate::{error::FleetError, pipe::PipeHub, transport::DuplexStream, tunnel::TunnelMux, ufs::UfsChannel};

/// Everything the server knows about one connected agent.
///
/// The identity fields mirror [`ClientInfo`] as advertised at handshake
/// time; `last_checkin` and `max_command_id` are server-local state the
/// dispatcher and reaper update as traffic flows. `outbound` is the
/// sending half of this client's connection: one logical client, one
/// outbound queue, so a slow or wedged peer can never block another
/// client's dispatch (spec §5).
///
/// `tunnel`/`ufs`/`pipes`/`transport_shutdown` are populated after
/// insertion via [`Registry::attach_resources`] (the connection handler
/// needs the record to exist before it can build them) and let
/// [`Registry::remove`] actually tear the connection's resources down
/// (spec §4.3: "close the transport, close any pipe readers and
/// writers, close tunnel and UFS listeners/connections, then delete the
/// registry entry") instead of merely dropping the map entry.
pub struct ClientRecord {
    pub uuid: String,
    pub hostname: String,
    pub arch: String,
    pub os: String,
    pub version: String,
    pub ips: Vec<String>,
    pub macs: Vec<String>,
    pub tags: HashMap<String, String>,
    pub namespace: String,
    pub last_checkin: Instant,
    pub max_command_id: u64,
    pub outbound: Sender<Message>,
    pub tunnel: Option<Arc<TunnelMux>>,
    pub ufs: Option<Arc<UfsChannel>>,
    pub pipes: Option<Arc<PipeHub>>,
    pub transport_shutdown: Mutex<Option<Box<dyn DuplexStream>>>,
}

impl ClientRecord {
    fn from_info(info: ClientInfo, outbound: Sender<Message>) -> ClientRecord {
        ClientRecord {
            uuid: info.uuid,
            hostname: info.hostname,
            arch: info.arch,
            os: info.os,
            version: info.version,
            ips: info.ips,
            macs: info.macs,
            tags: info.tags,
            namespace: info.namespace,
            last_checkin: Instant::now(),
            max_command_id: info.command_counter,
            outbound,
            tunnel: None,
            ufs: None,
            pipes: None,
            transport_shutdown: Mutex::new(None),
        }
    }

    pub fn touch(&mut self) {
        self.last_checkin = Instant::now();
    }

    pub fn expired(&self, reaper_interval: Duration) -> bool {
        self.last_checkin.elapsed() >= reaper_interval
    }

    /// Tear down every resource this record owns. Called once, from
    /// [`Registry::remove`], right before the entry is dropped.
    fn teardown(&self) {
        if let Some(tunnel) = &self.tunnel {
            tunnel.close_all();
        }
        if let Some(ufs) = &self.ufs {
            ufs.close_local();
        }
        if let Some(pipes) = &self.pipes {
            pipes.close_all();
        }
        if let Some(transport) = self.transport_shutdown.lock().unwrap().take() {
            if let Err(e) = transport.shutdown() {
                debug!(uuid = %self.uuid, error = %e, "transport shutdown failed, likely already closed");
            }
        }
    }

    #[cfg(test)]
    pub fn new_for_test(uuid: &str) -> ClientRecord {
        let (tx, _rx) = crossbeam_channel::unbounded();
        ClientRecord {
            uuid: uuid.to_string(),
            hostname: String::new(),
            arch: String::new(),
            os: String::new(),
            version: String::new(),
            ips: Vec::new(),
            macs: Vec::new(),
            tags: HashMap::new(),
            namespace: String::new(),
            last_checkin: Instant::now(),
            max_command_id: 0,
            outbound: tx,
            tunnel: None,
            ufs: None,
            pipes: None,
            transport_shutdown: Mutex::new(None),
        }
    }
}

/// The live set of connected clients, guarded by a single mutex for
/// structural changes (insert/remove). Readers that only need to fan a
/// message out take the same lock for the duration of the snapshot;
/// spec §5 accepts this because registry membership changes are rare
/// relative to dispatch.
#[derive(Clone)]
pub struct Registry {
    clients: Arc<Mutex<HashMap<String, ClientRecord>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry { clients: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Admit a newly handshaken client, replacing any prior record for
    /// the same UUID (a reconnect). Returns the previous record, if any,
    /// so the caller can tear down its old connection.
    #[instrument(skip_all, fields(uuid = %info.uuid))]
    pub fn insert(&self, info: ClientInfo, outbound: Sender<Message>) -> Option<ClientRecord> {
        let uuid = info.uuid.clone();
        let record = ClientRecord::from_info(info, outbound);
        let prev = self.clients.lock().unwrap().insert(uuid, record);
        if prev.is_some() {
            debug!("client reconnected, replacing prior session");
        } else {
            info!("client registered");
        }
        prev
    }

    /// Remove a client's record, tearing down any transport/tunnel/UFS/
    /// pipe resources it owns first (spec §4.3).
    pub fn remove(&self, uuid: &str) -> Option<ClientRecord> {
        let record = self.clients.lock().unwrap().remove(uuid)?;
        record.teardown();
        Some(record)
    }

    /// Attach the tunnel/UFS/pipe/transport handles built for a client
    /// once its record already exists. Split out from [`Registry::insert`]
    /// because those handles themselves need the outbound sender that
    /// `insert` takes, so they can only be constructed by the caller
    /// after insertion.
    pub fn attach_resources(
        &self,
        uuid: &str,
        tunnel: Arc<TunnelMux>,
        ufs: Arc<UfsChannel>,
        pipes: Arc<PipeHub>,
        transport: Box<dyn DuplexStream>,
    ) {
        self.with(uuid, |c| {
            c.tunnel = Some(tunnel);
            c.ufs = Some(ufs);
            c.pipes = Some(pipes);
            *c.transport_shutdown.lock().unwrap() = Some(transport);
        });
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.clients.lock().unwrap().contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` with exclusive access to a single client's record, if it
    /// is still registered. Used by the response handler to update
    /// `last_checkin`/`max_command_id` and by the dispatcher to read a
    /// send handle without cloning the whole record.
    pub fn with<R>(&self, uuid: &str, f: impl FnOnce(&mut ClientRecord) -> R) -> Option<R> {
        let mut guard = self.clients.lock().unwrap();
        guard.get_mut(uuid).map(f)
    }

    /// Fan a closure out over every registered client. The closure runs
    /// while the registry lock is held, so it must not block or it will
    /// stall inserts/removes for the duration (spec §5's rationale for
    /// keeping dispatch fan-out non-blocking: `outbound` is an unbounded
    /// channel send, never a socket write).
    pub fn for_each(&self, mut f: impl FnMut(&ClientRecord)) {
        let guard = self.clients.lock().unwrap();
        for record in guard.values() {
            f(record);
        }
    }

    /// Collect the UUIDs of every client whose `last_checkin` is older
    /// than `reaper_interval` (spec §4.12).
    pub fn expired_uuids(&self, reaper_interval: Duration) -> Vec<String> {
        let guard = self.clients.lock().unwrap();
        guard
            .values()
            .filter(|c| c.expired(reaper_interval))
            .map(|c| c.uuid.clone())
            .collect()
    }

    pub fn send_to(&self, uuid: &str, msg: Message) -> Result<(), FleetError> {
        let guard = self.clients.lock().unwrap();
        let record = guard.get(uuid).ok_or_else(|| FleetError::UnknownClient(uuid.to_string()))?;
        record
            .outbound
            .send(msg)
            .map_err(|_| FleetError::RegistryConflict(format!("client {uuid} outbound queue closed")))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn info(uuid: &str) -> ClientInfo {
        ClientInfo {
            uuid: uuid.to_string(),
            hostname: "host".to_string(),
            arch: "x86_64".to_string(),
            os: "linux".to_string(),
            version: "0.1.0".to_string(),
            ips: Vec::new(),
            macs: Vec::new(),
            tags: HashMap::new(),
            namespace: "default".to_string(),
            command_counter: 0,
        }
    }

    #[test]
    fn insert_then_lookup() {
        let reg = Registry::new();
        let (tx, _rx) = crossbeam_channel::unbounded();
        reg.insert(info("u1"), tx);
        assert!(reg.contains("u1"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn reconnect_replaces_prior_record() {
        let reg = Registry::new();
        let (tx1, _rx1) = crossbeam_channel::unbounded();
        let (tx2, _rx2) = crossbeam_channel::unbounded();
        reg.insert(info("u1"), tx1);
        let prev = reg.insert(info("u1"), tx2);
        assert!(prev.is_some());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_drops_client() {
        let reg = Registry::new();
        let (tx, _rx) = crossbeam_channel::unbounded();
        reg.insert(info("u1"), tx);
        assert!(reg.remove("u1").is_some());
        assert!(!reg.contains("u1"));
    }

    #[test]
    fn expired_uuids_respects_interval() {
        let reg = Registry::new();
        let (tx, _rx) = crossbeam_channel::unbounded();
        reg.insert(info("u1"), tx);
        assert!(reg.expired_uuids(Duration::from_secs(0)).contains(&"u1".to_string()));
        assert!(reg.expired_uuids(Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn send_to_unknown_client_is_an_error() {
        let reg = Registry::new();
        let err = reg.send_to("nope", Message::Heartbeat { uuid: Some("nope".to_string()), error: String::new() });
        assert!(matches!(err, Err(FleetError::UnknownClient(_))));
    }
}
