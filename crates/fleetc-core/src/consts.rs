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

use std::time::Duration;

/// Default period for the dispatcher's periodic broadcast (spec §4.6).
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default period after which a client with no checkin is reaped.
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// How often the reaper sweeps the registry looking for expired clients.
pub const REAPER_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Default chunk size for the file transport (spec §4.8).
pub const DEFAULT_FILE_CHUNK_SIZE: usize = 128 * 1024;

/// Size of the in-process pipe buffer used to trunk a tunnel/UFS stream
/// into discrete messages.
pub const TRUNK_BUF_SIZE: usize = 16 * 1024;

/// How long an accept() on a listening unix socket blocks before
/// re-checking whether the socket file still exists (spec §4.2).
pub const UNIX_ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Backoff between redial attempts for a dialed unix socket transport
/// (e.g. a VM's virtio-serial device that isn't open yet).
pub const DIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on the per-client outbound queue used to serialize sends.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;
