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

//! The dispatcher (spec §4.6): fans command deltas out to clients,
//! either on demand (a fresh command was just created) or periodically
//! (the broadcast thread catches up any client that missed a push).

use std::{sync::Arc, thread, time::Duration};

use fleetc_protocol::Message;
use tracing::{debug, info, instrument, warn};

use crate::{command::CommandStore, filter::CompiledFilter, registry::Registry};

/// Ties a [`Registry`] and a [`CommandStore`] together and knows how to
/// compute and send the command delta each client is owed.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Registry,
    commands: Arc<CommandStore>,
}

impl Dispatcher {
    pub fn new(registry: Registry, commands: Arc<CommandStore>) -> Dispatcher {
        Dispatcher { registry, commands }
    }

    /// Send every client the commands it hasn't seen yet, matching each
    /// command's filter against the client before including it. Per
    /// spec §4.6/§5, fan-out never blocks on an individual client: the
    /// registry lock covers only snapshotting the set of (uuid,
    /// max_command_id, outbound sender) triples, which is released
    /// before any filter evaluation or send happens.
    #[instrument(skip_all)]
    pub fn dispatch_all(&self) {
        let snapshot = self.snapshot_clients();
        for (uuid, max_command_id, _) in &snapshot {
            self.dispatch_to_uuid(uuid, *max_command_id);
        }
    }

    /// Dispatch the delta to a single client by uuid, looking up its
    /// current `max_command_id` first. Used after a single new command
    /// is created so its first eligible clients don't wait for the next
    /// periodic broadcast.
    pub fn dispatch_to(&self, uuid: &str) {
        let max_command_id = self.registry.with(uuid, |c| c.max_command_id);
        if let Some(max_command_id) = max_command_id {
            self.dispatch_to_uuid(uuid, max_command_id);
        }
    }

    fn snapshot_clients(&self) -> Vec<(String, u64, ())> {
        let mut out = Vec::new();
        self.registry.for_each(|c| out.push((c.uuid.clone(), c.max_command_id, ())));
        out
    }

    fn dispatch_to_uuid(&self, uuid: &str, max_command_id: u64) {
        let delta = self.commands.get_commands_since(max_command_id);
        let snapshot_max = delta.keys().next_back().copied();
        let Some(snapshot_max) = snapshot_max else {
            return;
        };

        let filtered: std::collections::BTreeMap<_, _> = delta
            .into_iter()
            .filter(|(_, command)| match &command.filter {
                Some(f) if !f.is_empty() => {
                    let matches = self.registry.with(uuid, |c| {
                        CompiledFilter::compile(f.clone()).matches(c)
                    });
                    matches.unwrap_or(false)
                }
                _ => true,
            })
            .collect();

        // Even if every command in the delta was filtered out for this
        // client, it has now seen (and rejected) up to snapshot_max, so
        // the watermark still advances — otherwise the same losing delta
        // gets recomputed on every future broadcast forever.
        if filtered.is_empty() {
            self.advance_watermark(uuid, snapshot_max);
            return;
        }

        let msg = Message::Command { uuid: Some(uuid.to_string()), error: String::new(), commands: filtered };

        match self.registry.send_to(uuid, msg) {
            Ok(()) => self.advance_watermark(uuid, snapshot_max),
            Err(e) => log_send_error(uuid, &e),
        }
    }

    fn advance_watermark(&self, uuid: &str, new_max: u64) {
        self.registry.with(uuid, |c| {
            if new_max > c.max_command_id {
                c.max_command_id = new_max;
            }
        });
    }
}

fn log_send_error(uuid: &str, err: &crate::error::FleetError) {
    // spec §9(a): broken-pipe-shaped failures are routine (the peer just
    // disconnected) and shouldn't be noisy; anything else is worth a
    // warning since it may indicate a wedged client.
    let is_broken_pipe = matches!(
        err,
        crate::error::FleetError::TransportEof
            | crate::error::FleetError::TransportReset
            | crate::error::FleetError::RegistryConflict(_)
    );
    if is_broken_pipe {
        debug!(uuid, error = %err, "dispatch send failed, client likely disconnected");
    } else {
        info!(uuid, error = %err, "dispatch send failed");
    }
}

/// Spawn the background thread that periodically calls
/// [`Dispatcher::dispatch_all`], so a client that misses an on-demand
/// push (e.g. it was still mid-handshake) eventually catches up. The
/// thread runs until `shutdown` is observed.
pub fn spawn_broadcast_thread(
    dispatcher: Dispatcher,
    interval: Duration,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        use std::sync::atomic::Ordering;
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(interval);
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            dispatcher.dispatch_all();
        }
        warn!("dispatcher broadcast thread exiting");
    })
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use fleetc_protocol::{ClientInfo, Command, Filter};

    use super::*;
    use crate::command::CommandStore;

    fn register(registry: &Registry, uuid: &str) -> crossbeam_channel::Receiver<Message> {
        let (tx, rx) = crossbeam_channel::unbounded();
        registry.insert(
            ClientInfo { uuid: uuid.to_string(), os: "linux".to_string(), ..Default::default() },
            tx,
        );
        rx
    }

    #[test]
    fn dispatch_all_sends_unfiltered_command_to_every_client() {
        let registry = Registry::new();
        let commands = Arc::new(CommandStore::new());
        let rx_a = register(&registry, "a");
        let rx_b = register(&registry, "b");

        commands.new_command(Command { argv: vec!["echo".to_string()], ..Default::default() });
        let dispatcher = Dispatcher::new(registry, commands);
        dispatcher.dispatch_all();

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn dispatch_all_respects_filter() {
        let registry = Registry::new();
        let commands = Arc::new(CommandStore::new());
        let rx_linux = register(&registry, "linux-client");
        let rx_win = register(&registry, "win-client");
        registry.with("win-client", |c| c.os = "windows".to_string());

        commands.new_command(Command {
            filter: Some(Filter { os: Some("linux".to_string()), ..Default::default() }),
            ..Default::default()
        });
        let dispatcher = Dispatcher::new(registry, commands);
        dispatcher.dispatch_all();

        assert!(rx_linux.try_recv().is_ok());
        assert!(rx_win.try_recv().is_err());
    }

    #[test]
    fn repeated_dispatch_does_not_resend_already_seen_commands() {
        let registry = Registry::new();
        let commands = Arc::new(CommandStore::new());
        let rx = register(&registry, "a");
        commands.new_command(Command::default());
        let dispatcher = Dispatcher::new(registry, commands);

        dispatcher.dispatch_all();
        assert!(rx.try_recv().is_ok());
        dispatcher.dispatch_all();
        assert!(rx.try_recv().is_err(), "second dispatch should not resend the same delta");
    }

    #[test]
    fn dispatch_to_single_uuid_only_affects_that_client() {
        let registry = Registry::new();
        let commands = Arc::new(CommandStore::new());
        let rx_a = register(&registry, "a");
        let rx_b = register(&registry, "b");
        commands.new_command(Command::default());
        let dispatcher = Dispatcher::new(registry, commands);

        dispatcher.dispatch_to("a");
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }
}
