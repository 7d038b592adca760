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

//! The operator-facing API (spec §6): the surface a CLI or higher-level
//! tool calls to list/create/delete/reset commands, inspect clients,
//! set up forwards, and fetch files, all routed through the same
//! registry/command-store/dispatcher the wire protocol uses internally.

use std::{collections::BTreeMap, net::TcpStream, sync::Arc};

use fleetc_protocol::{Command, Filter};

use crate::{
    command::{CommandRecord, CommandStore},
    dispatcher::Dispatcher,
    error::FleetError,
    registry::Registry,
    tunnel::TunnelMux,
};

/// One connected client's identity, as surfaced to an operator (a
/// read-only projection of [`crate::registry::ClientRecord`] — the
/// outbound send handle never leaves the core).
#[derive(Debug, Clone)]
pub struct ClientSummary {
    pub uuid: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub namespace: String,
    pub tags: std::collections::HashMap<String, String>,
}

/// The facade handed to whatever drives the server: a CLI, an RPC
/// frontend, or (in tests) direct calls.
#[derive(Clone)]
pub struct Operator {
    registry: Registry,
    commands: Arc<CommandStore>,
    dispatcher: Dispatcher,
}

impl Operator {
    pub fn new(registry: Registry, commands: Arc<CommandStore>, dispatcher: Dispatcher) -> Operator {
        Operator { registry, commands, dispatcher }
    }

    /// Create a new command and immediately push it to every
    /// currently-matching client rather than waiting for the next
    /// periodic broadcast.
    pub fn new_command(&self, command: Command) -> u64 {
        let id = self.commands.new_command(command);
        self.dispatcher.dispatch_all();
        id
    }

    pub fn get_command(&self, id: u64) -> Result<CommandRecord, FleetError> {
        self.commands.get_command(id)
    }

    pub fn list_commands(&self) -> BTreeMap<u64, Command> {
        self.commands.get_all_commands()
    }

    pub fn delete_command(&self, id: u64) -> Result<(), FleetError> {
        self.commands.delete_command(id)
    }

    /// Clear every stored command and rewind every connected client's
    /// `max_command_id` to zero, so a freshly re-created command id 1
    /// is delivered to everyone again (spec §4.4's reset semantics).
    pub fn reset(&self) {
        self.commands.reset();
        self.rewind_all_clients();
    }

    fn rewind_all_clients(&self) {
        let uuids: Vec<String> = {
            let mut out = Vec::new();
            self.registry.for_each(|c| out.push(c.uuid.clone()));
            out
        };
        for uuid in uuids {
            self.registry.with(&uuid, |c| c.max_command_id = 0);
        }
    }

    pub fn list_clients(&self) -> Vec<ClientSummary> {
        let mut out = Vec::new();
        self.registry.for_each(|c| {
            out.push(ClientSummary {
                uuid: c.uuid.clone(),
                hostname: c.hostname.clone(),
                os: c.os.clone(),
                arch: c.arch.clone(),
                namespace: c.namespace.clone(),
                tags: c.tags.clone(),
            });
        });
        out
    }

    pub fn get_client(&self, uuid: &str) -> Option<ClientSummary> {
        self.registry.with(uuid, |c| ClientSummary {
            uuid: c.uuid.clone(),
            hostname: c.hostname.clone(),
            os: c.os.clone(),
            arch: c.arch.clone(),
            namespace: c.namespace.clone(),
            tags: c.tags.clone(),
        })
    }

    /// Build a command whose sole purpose is a file transfer, the
    /// operator-facing wrapper spec §6 calls `files_send`/`files_recv`.
    pub fn send_files(&self, filter: Filter, paths: Vec<String>) -> u64 {
        self.new_command(Command { filter: Some(filter), files_send: paths, ..Default::default() })
    }

    pub fn recv_files(&self, filter: Filter, paths: Vec<String>) -> u64 {
        self.new_command(Command { filter: Some(filter), files_recv: paths, ..Default::default() })
    }

    /// **Forward**: accept local TCP connections on `local` and tunnel
    /// each through to `remote_addr` as seen from `uuid`'s agent.
    pub fn forward(&self, mux: &Arc<TunnelMux>, local: TcpStream, remote_addr: String) -> Result<(), FleetError> {
        mux.forward(local, remote_addr)
    }

    /// **Reverse**: ask `uuid`'s agent to expose `remote_addr` (as seen
    /// from the agent) back to the operator via a locally-listening
    /// port.
    pub fn reverse(&self, mux: &Arc<TunnelMux>, listener: std::net::TcpListener, remote_addr: String) {
        mux.reverse_listen(listener, remote_addr)
    }
}

#[cfg(test)]
mod test {
    use fleetc_protocol::ClientInfo;

    use super::*;
    use crate::command::CommandStore;

    fn setup() -> (Operator, crossbeam_channel::Receiver<fleetc_protocol::Message>) {
        let registry = Registry::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        registry.insert(ClientInfo { uuid: "c1".to_string(), ..Default::default() }, tx);
        let commands = Arc::new(CommandStore::new());
        let dispatcher = Dispatcher::new(registry.clone(), commands.clone());
        (Operator::new(registry, commands, dispatcher), rx)
    }

    #[test]
    fn new_command_dispatches_immediately() {
        let (op, rx) = setup();
        op.new_command(Command::default());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn list_and_delete_command() {
        let (op, _rx) = setup();
        let id = op.new_command(Command::default());
        assert_eq!(op.list_commands().len(), 1);
        op.delete_command(id).unwrap();
        assert_eq!(op.list_commands().len(), 0);
    }

    #[test]
    fn reset_rewinds_client_watermark() {
        let (op, rx) = setup();
        let id = op.new_command(Command::default());
        rx.try_recv().unwrap();
        op.reset();
        assert_eq!(op.list_commands().len(), 0);
        // recreating a command now gets id 1 again and is resent, since
        // the client's watermark was rewound to 0
        let new_id = op.new_command(Command::default());
        assert_eq!(new_id, 1);
        assert_ne!(new_id, id + 1);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn list_clients_reports_registered_clients() {
        let (op, _rx) = setup();
        let clients = op.list_clients();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].uuid, "c1");
    }
}
