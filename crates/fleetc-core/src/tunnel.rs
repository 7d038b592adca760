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

//! The tunnel multiplexer (spec §4.9): TCP forwarding riding on top of
//! the same connection as everything else. A single `TUNNEL` message
//! stream is trunked: every byte that crosses it is actually a
//! "minitunnel" frame naming which numbered sub-channel it belongs to,
//! so many independent forwarded TCP streams share one wire connection.

use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    thread,
};

use crossbeam_channel::Sender;
use fleetc_protocol::Message;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::{consts, error::FleetError};

/// One frame of the sub-protocol multiplexed inside `TUNNEL` message
/// payloads. Encoded/decoded with the same bincode codec as everything
/// else, just nested one level deeper.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MinitunnelFrame {
    pub channel: u32,
    pub kind: MinitunnelKind,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinitunnelKind {
    Open,
    Data,
    Close,
}

fn encode_frame(frame: &MinitunnelFrame) -> Vec<u8> {
    bincode::serialize(frame).expect("minitunnel frame always serializes")
}

fn decode_frame(bytes: &[u8]) -> Result<MinitunnelFrame, FleetError> {
    bincode::deserialize(bytes).map_err(|e| FleetError::TunnelSetup(format!("bad minitunnel frame: {e}")))
}

/// The sending half of a tunnel: wraps minitunnel frames in `TUNNEL`
/// messages addressed at `uuid` and hands them to the client's outbound
/// queue. Cloning is cheap (an `Arc` around the registry send handle),
/// which is what lets a sub-channel's worker thread send without
/// needing a reference back into the owning [`TunnelMux`] (spec's "weak
/// reference-style send closures to avoid cyclic Arc references" note:
/// a sub-channel only ever needs to send, never to reach back into the
/// multiplexer that spawned it).
#[derive(Clone)]
pub struct TunnelSink {
    uuid: String,
    outbound: Sender<Message>,
}

impl TunnelSink {
    pub fn new(uuid: impl Into<String>, outbound: Sender<Message>) -> TunnelSink {
        TunnelSink { uuid: uuid.into(), outbound }
    }

    fn send_frame(&self, frame: MinitunnelFrame) -> Result<(), FleetError> {
        let data = encode_frame(&frame);
        self.outbound
            .send(Message::Tunnel { uuid: Some(self.uuid.clone()), error: String::new(), data })
            .map_err(|_| FleetError::TunnelSetup(format!("client {} outbound queue closed", self.uuid)))
    }
}

/// Demultiplexes incoming `TUNNEL` messages into their sub-channels and
/// owns the local TCP half of each open sub-channel. One instance is
/// shared between a client's tunnel-forward and tunnel-reverse
/// operations.
pub struct TunnelMux {
    sink: TunnelSink,
    channels: Mutex<HashMap<u32, Sender<Vec<u8>>>>,
    next_channel: AtomicU32,
}

impl TunnelMux {
    pub fn new(sink: TunnelSink) -> Arc<TunnelMux> {
        Arc::new(TunnelMux { sink, channels: Mutex::new(HashMap::new()), next_channel: AtomicU32::new(1) })
    }

    fn allocate_channel(&self) -> u32 {
        self.next_channel.fetch_add(1, Ordering::Relaxed)
    }

    /// **Forward**: the operator's side opens a sub-channel and pumps a
    /// locally-accepted TCP connection's bytes through it, so
    /// connecting to a local port reaches an address only the remote
    /// client can see.
    #[instrument(skip_all)]
    pub fn forward(self: &Arc<Self>, local: TcpStream, remote_addr: String) -> Result<(), FleetError> {
        let channel = self.allocate_channel();
        let (tx, rx) = crossbeam_channel::unbounded();
        self.channels.lock().unwrap().insert(channel, tx);
        self.sink.send_frame(MinitunnelFrame { channel, kind: MinitunnelKind::Open, data: remote_addr.into_bytes() })?;
        self.pump(channel, local, rx);
        Ok(())
    }

    /// **Reverse**: the client side asked to expose one of its local
    /// ports back to the operator; the server listens locally and
    /// forwards each accepted connection through a fresh sub-channel.
    #[instrument(skip_all)]
    pub fn reverse_listen(self: &Arc<Self>, listener: TcpListener, remote_addr: String) {
        let mux = Arc::clone(self);
        thread::spawn(move || {
            for conn in listener.incoming() {
                match conn {
                    Ok(stream) => {
                        let mux = Arc::clone(&mux);
                        let remote_addr = remote_addr.clone();
                        thread::spawn(move || {
                            if let Err(e) = mux.forward(stream, remote_addr) {
                                warn!(error = %e, "reverse tunnel forward failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accepting reverse tunnel connection"),
                }
            }
        });
    }

    /// Tear down every open sub-channel without a wire round-trip.
    /// Dropping each sender ends its `pump`'s `from_wire.iter()` loop on
    /// its own, which closes the associated local TCP half too. Used
    /// when the underlying connection is already gone (client removal,
    /// spec §4.3).
    pub fn close_all(&self) {
        self.channels.lock().unwrap().clear();
    }

    /// Route one decoded minitunnel frame arriving from the wire to its
    /// sub-channel.
    pub fn on_frame(&self, frame: MinitunnelFrame) {
        let mut channels = self.channels.lock().unwrap();
        match frame.kind {
            MinitunnelKind::Data => {
                if let Some(tx) = channels.get(&frame.channel) {
                    let _ = tx.send(frame.data);
                }
            }
            MinitunnelKind::Close => {
                channels.remove(&frame.channel);
            }
            MinitunnelKind::Open => {
                debug!(channel = frame.channel, "peer opened a sub-channel we did not request, ignoring");
            }
        }
    }

    /// Shuttle bytes between the local TCP stream and the sub-channel
    /// for as long as both stay open.
    fn pump(&self, channel: u32, local: TcpStream, from_wire: crossbeam_channel::Receiver<Vec<u8>>) {
        let mut read_half = local.try_clone().expect("tcp stream clone");
        let sink = self.sink.clone();
        let reader = thread::spawn(move || {
            let mut buf = vec![0u8; consts::TRUNK_BUF_SIZE];
            loop {
                match read_half.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if sink
                            .send_frame(MinitunnelFrame { channel, kind: MinitunnelKind::Data, data: buf[..n].to_vec() })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = sink.send_frame(MinitunnelFrame { channel, kind: MinitunnelKind::Close, data: Vec::new() });
        });

        let mut write_half = local;
        for chunk in from_wire.iter() {
            if write_half.write_all(&chunk).is_err() {
                break;
            }
        }
        let _ = write_half.shutdown(std::net::Shutdown::Both);
        let _ = reader.join();
        self.channels.lock().unwrap().remove(&channel);
    }
}

/// Decode a `TUNNEL` message's payload and route it into `mux`.
pub fn on_tunnel_message(mux: &TunnelMux, data: &[u8]) -> Result<(), FleetError> {
    let frame = decode_frame(data)?;
    mux.on_frame(frame);
    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn frame_round_trips_through_bincode() {
        let frame = MinitunnelFrame { channel: 7, kind: MinitunnelKind::Data, data: b"hi".to_vec() };
        let bytes = encode_frame(&frame);
        let decoded = decode_frame(&bytes).unwrap();
        assert_eq!(decoded.channel, 7);
        assert_eq!(decoded.data, b"hi");
    }

    #[test]
    fn forward_opens_and_pumps_data_end_to_end() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mux = TunnelMux::new(TunnelSink::new("agent-1", tx));

        // Two ends of a real socket stand in for "the operator's local
        // connection" (`local`, handed to forward()) and "the operator's
        // process on the other end of that connection" (`peer`, which we
        // drive directly from the test).
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = thread::spawn(move || listener.accept().unwrap().0);
        let local = TcpStream::connect(addr).unwrap();
        let mut peer = accept.join().unwrap();

        let mux2 = Arc::clone(&mux);
        let forwarder = thread::spawn(move || {
            mux2.forward(local, "10.0.0.5:9000".to_string()).unwrap();
        });

        // first message off the wire is the Open frame
        let open_msg = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        let open_frame = match open_msg {
            Message::Tunnel { data, .. } => decode_frame(&data).unwrap(),
            _ => panic!("expected a tunnel message"),
        };
        assert_eq!(open_frame.kind, MinitunnelKind::Open);
        assert_eq!(open_frame.data, b"10.0.0.5:9000");
        let channel = open_frame.channel;

        peer.write_all(b"hello").unwrap();
        let data_msg = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        let data_frame = match data_msg {
            Message::Tunnel { data, .. } => decode_frame(&data).unwrap(),
            _ => panic!("expected a tunnel message"),
        };
        assert_eq!(data_frame.kind, MinitunnelKind::Data);
        assert_eq!(data_frame.data, b"hello");

        // simulate the remote side answering back over the same sub-channel
        mux.on_frame(MinitunnelFrame { channel, kind: MinitunnelKind::Data, data: b"world".to_vec() });
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");

        peer.shutdown(std::net::Shutdown::Both).unwrap();
        forwarder.join().unwrap();
    }
}
