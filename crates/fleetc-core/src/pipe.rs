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

//! The named-pipe stdio plane (spec §3/§4.10): routes a command's
//! `stdin`/`stdout`/`stderr` names through `PIPE` messages instead of
//! folding the bytes into the eventual `Response`, so a long-running
//! backgrounded command's output can be consumed live. Distinct from the
//! UFS plane ([`crate::ufs`]) in that many named pipes can be open on a
//! client at once, keyed by name rather than being a single trunk.

use std::{collections::HashMap, sync::Mutex};

use crossbeam_channel::{Receiver, Sender};
use fleetc_protocol::{Message, PipeFrame, PipeMode};
use tracing::debug;

use crate::error::FleetError;

/// Server-side handle to one client's set of named pipes. Each `open()`
/// gets its own inbound queue; `send_data`/`close` address a pipe by
/// name the same way the wire frames do.
pub struct PipeHub {
    uuid: String,
    outbound: Sender<Message>,
    channels: Mutex<HashMap<String, Sender<Vec<u8>>>>,
}

impl PipeHub {
    pub fn new(uuid: impl Into<String>, outbound: Sender<Message>) -> PipeHub {
        PipeHub { uuid: uuid.into(), outbound, channels: Mutex::new(HashMap::new()) }
    }

    /// Register interest in `name`, returning the receiver that will
    /// carry its inbound `Data` payloads until it's closed. A second
    /// `open()` for the same name replaces the prior receiver.
    pub fn open(&self, name: &str) -> Receiver<Vec<u8>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.channels.lock().unwrap().insert(name.to_string(), tx);
        let _ = self.send(name, PipeMode::Open, Vec::new());
        rx
    }

    pub fn send_data(&self, name: &str, data: Vec<u8>) -> Result<(), FleetError> {
        self.send(name, PipeMode::Data, data)
    }

    pub fn close(&self, name: &str) -> Result<(), FleetError> {
        self.channels.lock().unwrap().remove(name);
        self.send(name, PipeMode::Close, Vec::new())
    }

    /// Tear down every open pipe without a wire round-trip, for use when
    /// the underlying connection is already gone (client removal, spec
    /// §4.3's "close any pipe readers and writers").
    pub fn close_all(&self) {
        self.channels.lock().unwrap().clear();
    }

    fn send(&self, name: &str, mode: PipeMode, data: Vec<u8>) -> Result<(), FleetError> {
        self.outbound
            .send(Message::Pipe {
                uuid: Some(self.uuid.clone()),
                error: String::new(),
                pipe: PipeFrame { name: name.to_string(), mode, data },
            })
            .map_err(|_| FleetError::TunnelSetup(format!("client {} outbound queue closed", self.uuid)))
    }

    /// Route a `PIPE` message received from the wire to its named
    /// channel, if anyone is listening for it.
    pub fn on_frame(&self, frame: PipeFrame) {
        let mut channels = self.channels.lock().unwrap();
        match frame.mode {
            PipeMode::Data => {
                if let Some(tx) = channels.get(&frame.name) {
                    let _ = tx.send(frame.data);
                } else {
                    debug!(name = %frame.name, "dropping pipe data for a pipe nobody is listening on");
                }
            }
            PipeMode::Close => {
                channels.remove(&frame.name);
            }
            PipeMode::Open => {
                debug!(name = %frame.name, "peer opened a pipe we did not request, ignoring");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_then_data_then_close_round_trip() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let hub = PipeHub::new("c1", tx);
        let inbound = hub.open("stdout");

        hub.send_data("stdout", b"hello".to_vec()).unwrap();
        hub.close("stdout").unwrap();

        let open_msg = rx.recv().unwrap();
        assert!(matches!(open_msg, Message::Pipe { pipe: PipeFrame { mode: PipeMode::Open, .. }, .. }));
        let data_msg = rx.recv().unwrap();
        assert!(matches!(data_msg, Message::Pipe { pipe: PipeFrame { mode: PipeMode::Data, .. }, .. }));
        let close_msg = rx.recv().unwrap();
        assert!(matches!(close_msg, Message::Pipe { pipe: PipeFrame { mode: PipeMode::Close, .. }, .. }));

        hub.on_frame(PipeFrame { name: "stdin".to_string(), mode: PipeMode::Data, data: b"world".to_vec() });
        assert!(inbound.try_recv().is_err(), "data for a different pipe name must not cross channels");
    }

    #[test]
    fn data_for_unopened_pipe_is_dropped_not_queued() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let hub = PipeHub::new("c1", tx);
        hub.on_frame(PipeFrame { name: "stdin".to_string(), mode: PipeMode::Data, data: b"ignored".to_vec() });
    }

    #[test]
    fn close_all_drops_every_channel() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let hub = PipeHub::new("c1", tx);
        let inbound = hub.open("stdout");
        hub.close_all();
        hub.on_frame(PipeFrame { name: "stdout".to_string(), mode: PipeMode::Data, data: b"x".to_vec() });
        assert!(inbound.try_recv().is_err());
    }
}
