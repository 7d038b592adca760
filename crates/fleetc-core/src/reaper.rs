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

//! The reaper (spec §4.12): a background sweep that removes clients
//! which haven't checked in within `reaper_interval`, grounded on the
//! same sweep-thread shape as `libshpool`'s `ttl_reaper`.

use std::{
    sync::{atomic::{AtomicBool, Ordering}, Arc},
    thread,
    time::Duration,
};

use tracing::{info, instrument};

use crate::{consts, registry::Registry};

/// Spawn the reaper thread. It wakes every
/// [`consts::REAPER_SWEEP_INTERVAL`] and removes any client whose
/// `last_checkin` is at least `reaper_interval` old. Removal only drops
/// the registry entry; any transport already broke on its own and its
/// handler thread exits independently (spec §5: "never affect other
/// clients").
#[instrument(skip_all)]
pub fn spawn(registry: Registry, reaper_interval: Duration, shutdown: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(consts::REAPER_SWEEP_INTERVAL);
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sweep(&registry, reaper_interval);
        }
        info!("reaper thread exiting");
    })
}

fn sweep(registry: &Registry, reaper_interval: Duration) {
    for uuid in registry.expired_uuids(reaper_interval) {
        info!(uuid, "reaping client with no recent checkin");
        registry.remove(&uuid);
    }
}
