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

//! The UFS plane (spec §6 / glossary): a single trunked byte stream per
//! client, distinct from the tunnel multiplexer because it carries one
//! logical connection rather than many numbered sub-channels. The bytes
//! themselves are opaque to the core — whatever filesystem-protocol
//! service rides on top interprets them.

use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender};
use fleetc_protocol::{Message, UfsFrame, UfsMode};
use tracing::{debug, instrument};

use crate::error::FleetError;

/// Lifecycle of the one logical UFS connection a client can have open at
/// a time, mirroring the `NEW -> STREAMING -> DONE` shape spec §5 uses
/// for file transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UfsState {
    Closed,
    Open,
}

/// Server-side handle to one client's UFS plane: sends frames out over
/// its `Message` outbound queue and hands inbound bytes to whoever
/// called [`UfsChannel::listen`].
pub struct UfsChannel {
    uuid: String,
    outbound: Sender<Message>,
    state: Mutex<UfsState>,
    inbound_tx: Sender<Vec<u8>>,
    inbound_rx: Mutex<Option<Receiver<Vec<u8>>>>,
}

impl UfsChannel {
    pub fn new(uuid: impl Into<String>, outbound: Sender<Message>) -> UfsChannel {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        UfsChannel {
            uuid: uuid.into(),
            outbound,
            state: Mutex::new(UfsState::Closed),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    pub fn state(&self) -> UfsState {
        *self.state.lock().unwrap()
    }

    /// Take the inbound receiver. May only be called once per channel;
    /// a second call returns `None`, since a UFS plane has exactly one
    /// consumer.
    pub fn listen(&self) -> Option<Receiver<Vec<u8>>> {
        self.inbound_rx.lock().unwrap().take()
    }

    #[instrument(skip_all, fields(uuid = %self.uuid))]
    pub fn open(&self) -> Result<(), FleetError> {
        *self.state.lock().unwrap() = UfsState::Open;
        self.send(UfsMode::Open, Vec::new())
    }

    pub fn send_data(&self, data: Vec<u8>) -> Result<(), FleetError> {
        if self.state() != UfsState::Open {
            return Err(FleetError::TunnelSetup(format!("UFS plane for {} is not open", self.uuid)));
        }
        self.send(UfsMode::Data, data)
    }

    #[instrument(skip_all, fields(uuid = %self.uuid))]
    pub fn close(&self) -> Result<(), FleetError> {
        *self.state.lock().unwrap() = UfsState::Closed;
        self.send(UfsMode::Close, Vec::new())
    }

    /// Close the plane locally without sending a wire message, for use
    /// when the underlying connection is already gone (client removal,
    /// spec §4.3) rather than a normal operator-initiated close.
    pub fn close_local(&self) {
        *self.state.lock().unwrap() = UfsState::Closed;
    }

    fn send(&self, mode: UfsMode, data: Vec<u8>) -> Result<(), FleetError> {
        self.outbound
            .send(Message::Ufs { uuid: Some(self.uuid.clone()), error: String::new(), ufs: UfsFrame { mode, data } })
            .map_err(|_| FleetError::TunnelSetup(format!("client {} outbound queue closed", self.uuid)))
    }

    /// Route a `UFS` message received from the wire into this channel's
    /// state machine / inbound queue.
    pub fn on_frame(&self, frame: UfsFrame) {
        match frame.mode {
            UfsMode::Open => *self.state.lock().unwrap() = UfsState::Open,
            UfsMode::Close => *self.state.lock().unwrap() = UfsState::Closed,
            UfsMode::Data => {
                if self.state() == UfsState::Open {
                    let _ = self.inbound_tx.send(frame.data);
                } else {
                    debug!(uuid = %self.uuid, "dropping UFS data for a plane that isn't open");
                }
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
        let chan = UfsChannel::new("c1", tx);
        let inbound = chan.listen().unwrap();

        chan.open().unwrap();
        chan.send_data(b"hello".to_vec()).unwrap();
        chan.close().unwrap();

        let open_msg = rx.recv().unwrap();
        assert!(matches!(open_msg, Message::Ufs { ufs: UfsFrame { mode: UfsMode::Open, .. }, .. }));
        let data_msg = rx.recv().unwrap();
        assert!(matches!(data_msg, Message::Ufs { ufs: UfsFrame { mode: UfsMode::Data, .. }, .. }));
        let close_msg = rx.recv().unwrap();
        assert!(matches!(close_msg, Message::Ufs { ufs: UfsFrame { mode: UfsMode::Close, .. }, .. }));

        chan.on_frame(UfsFrame { mode: UfsMode::Open, data: Vec::new() });
        chan.on_frame(UfsFrame { mode: UfsMode::Data, data: b"world".to_vec() });
        assert_eq!(inbound.recv().unwrap(), b"world");
    }

    #[test]
    fn sending_data_before_open_is_rejected() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let chan = UfsChannel::new("c1", tx);
        assert!(chan.send_data(b"x".to_vec()).is_err());
    }

    #[test]
    fn data_arriving_while_closed_is_dropped_not_queued() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let chan = UfsChannel::new("c1", tx);
        let inbound = chan.listen().unwrap();
        chan.on_frame(UfsFrame { mode: UfsMode::Data, data: b"ignored".to_vec() });
        assert!(inbound.try_recv().is_err());
    }

    #[test]
    fn listen_can_only_be_taken_once() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let chan = UfsChannel::new("c1", tx);
        assert!(chan.listen().is_some());
        assert!(chan.listen().is_none());
    }
}
