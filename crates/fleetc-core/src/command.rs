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

//! The command store (spec §4.4): monotonic id assignment, the
//! checked-in set per command, and reset semantics.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use fleetc_protocol::Command;
use tracing::{info, instrument};

use crate::error::FleetError;

/// A stored command plus the set of client UUIDs that have acked it.
/// Cloned out of the store on every read so callers never hold the
/// store's lock while they work with a command (spec §4.4's
/// deep-copy-on-read rule).
#[derive(Clone, Debug)]
pub struct CommandRecord {
    pub command: Command,
    pub checked_in: HashSet<String>,
}

struct Inner {
    commands: BTreeMap<u64, CommandRecord>,
    next_id: u64,
}

/// Thread-safe command table. One instance per server process.
pub struct CommandStore {
    inner: Mutex<Inner>,
}

impl CommandStore {
    pub fn new() -> CommandStore {
        CommandStore { inner: Mutex::new(Inner { commands: BTreeMap::new(), next_id: 1 }) }
    }

    /// Assign the next id, store the command under it, and return the id
    /// (spec §4.4: ids are assigned monotonically and never reused within
    /// a store generation).
    #[instrument(skip_all)]
    pub fn new_command(&self, mut command: Command) -> u64 {
        let mut guard = self.inner.lock().unwrap();
        let id = guard.next_id;
        guard.next_id += 1;
        command.id = id;
        guard.commands.insert(id, CommandRecord { command, checked_in: HashSet::new() });
        info!(id, "command stored");
        id
    }

    /// A deep copy of one command record.
    pub fn get_command(&self, id: u64) -> Result<CommandRecord, FleetError> {
        self.inner
            .lock()
            .unwrap()
            .commands
            .get(&id)
            .cloned()
            .ok_or(FleetError::UnknownCommand(id))
    }

    /// A deep copy of every command whose id is greater than
    /// `since_id`, in ascending id order — the delta the dispatcher sends
    /// a client whose `max_command_id` is `since_id` (spec §4.6).
    pub fn get_commands_since(&self, since_id: u64) -> BTreeMap<u64, Command> {
        self.inner
            .lock()
            .unwrap()
            .commands
            .range((since_id + 1)..)
            .map(|(id, record)| (*id, record.command.clone()))
            .collect()
    }

    /// All stored commands, deep-copied.
    pub fn get_all_commands(&self) -> BTreeMap<u64, Command> {
        self.inner
            .lock()
            .unwrap()
            .commands
            .iter()
            .map(|(id, record)| (*id, record.command.clone()))
            .collect()
    }

    pub fn delete_command(&self, id: u64) -> Result<(), FleetError> {
        let mut guard = self.inner.lock().unwrap();
        guard.commands.remove(&id).ok_or(FleetError::UnknownCommand(id))?;
        Ok(())
    }

    /// Record that `uuid` has acked `id`. Unknown commands are logged
    /// and ignored per spec §4.7 — never a fatal error, since the delete
    /// may have raced the response in flight.
    pub fn mark_checked_in(&self, id: u64, uuid: &str) {
        let mut guard = self.inner.lock().unwrap();
        match guard.commands.get_mut(&id) {
            Some(record) => {
                record.checked_in.insert(uuid.to_string());
            }
            None => {
                tracing::debug!(id, uuid, "response for unknown/deleted command, ignoring");
            }
        }
    }

    pub fn highest_id(&self) -> u64 {
        self.inner.lock().unwrap().commands.keys().next_back().copied().unwrap_or(0)
    }

    /// Clear the table and restart id assignment from 1. Per-client
    /// `max_command_id` bookkeeping is the registry's responsibility; the
    /// caller must also reset every client record after calling this
    /// (spec §4.4).
    #[instrument(skip_all)]
    pub fn reset(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.commands.clear();
        guard.next_id = 1;
        info!("command store reset");
    }
}

impl Default for CommandStore {
    fn default() -> Self {
        CommandStore::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cmd(argv: &[&str]) -> Command {
        Command { argv: argv.iter().map(|s| s.to_string()).collect(), ..Default::default() }
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let store = CommandStore::new();
        let a = store.new_command(cmd(&["echo", "a"]));
        let b = store.new_command(cmd(&["echo", "b"]));
        assert!(b > a);
        store.delete_command(a).unwrap();
        let c = store.new_command(cmd(&["echo", "c"]));
        assert!(c > b);
    }

    #[test]
    fn get_command_is_a_deep_copy() {
        let store = CommandStore::new();
        let id = store.new_command(cmd(&["echo", "a"]));
        let mut copy = store.get_command(id).unwrap();
        copy.checked_in.insert("client-1".to_string());
        let fresh = store.get_command(id).unwrap();
        assert!(fresh.checked_in.is_empty());
    }

    #[test]
    fn unknown_command_is_an_error_on_direct_lookup() {
        let store = CommandStore::new();
        assert!(matches!(store.get_command(999), Err(FleetError::UnknownCommand(999))));
    }

    #[test]
    fn mark_checked_in_on_unknown_command_does_not_panic() {
        let store = CommandStore::new();
        store.mark_checked_in(999, "client-1");
    }

    #[test]
    fn get_commands_since_returns_only_the_delta() {
        let store = CommandStore::new();
        let a = store.new_command(cmd(&["a"]));
        let b = store.new_command(cmd(&["b"]));
        let delta = store.get_commands_since(a);
        assert_eq!(delta.len(), 1);
        assert!(delta.contains_key(&b));
    }

    #[test]
    fn reset_clears_table_and_restarts_ids() {
        let store = CommandStore::new();
        store.new_command(cmd(&["a"]));
        store.new_command(cmd(&["b"]));
        store.reset();
        assert_eq!(store.get_all_commands().len(), 0);
        let id = store.new_command(cmd(&["c"]));
        assert_eq!(id, 1);
    }
}
