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

//! Transport bindings (spec §4.2): TCP, a listening unix socket, and a
//! dialed unix socket (for VM serial devices the server must connect
//! out to rather than accept on). Every binding eventually hands the
//! connection handler a boxed duplex byte stream; everything above this
//! module is transport-agnostic.

use std::{
    fs, io,
    net::{TcpListener, TcpStream},
    path::{Path, PathBuf},
    sync::{atomic::{AtomicBool, Ordering}, Arc},
    thread,
};

#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};

use fleetc_protocol::{decode_from, encode_to, VersionHeader, VERSION};
use tracing::{info, instrument, warn};

use crate::{consts, error::FleetError};

/// A byte stream both sides can read and write, independent of whether
/// it's backed by TCP or a unix socket.
pub trait DuplexStream: io::Read + io::Write + Send {
    fn try_clone_box(&self) -> io::Result<Box<dyn DuplexStream>>;

    /// Actively tear down the connection, unblocking any thread parked
    /// in a read on a clone of this stream. Used by the registry on
    /// client removal (spec §4.3's "close the transport") so a reaped or
    /// evicted client's handler thread doesn't keep blocking forever on
    /// a socket nobody is writing to anymore.
    fn shutdown(&self) -> io::Result<()>;
}

impl DuplexStream for TcpStream {
    fn try_clone_box(&self) -> io::Result<Box<dyn DuplexStream>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, std::net::Shutdown::Both)
    }
}

#[cfg(unix)]
impl DuplexStream for UnixStream {
    fn try_clone_box(&self) -> io::Result<Box<dyn DuplexStream>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown(&self) -> io::Result<()> {
        UnixStream::shutdown(self, std::net::Shutdown::Both)
    }
}

/// Exchange `VersionHeader`s immediately after connecting, in both
/// directions. A mismatch is surfaced as a warning, never a connection
/// failure (spec §4.1: "a mismatched protocol version is surfaced as a
/// warning but does not terminate the connection").
#[instrument(skip_all)]
pub fn exchange_version_header(stream: &mut dyn DuplexStream) -> Result<(), FleetError> {
    encode_to(&VersionHeader { version: VERSION.to_string() }, &mut *stream)?;
    let peer: VersionHeader = decode_from(&mut *stream)?;
    if peer.version != VERSION {
        warn!(local = VERSION, peer = %peer.version, "protocol version mismatch with peer");
    }
    Ok(())
}

/// Bind a TCP listener on `port`, accepting on all interfaces.
pub fn listen_tcp(port: u16) -> io::Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port))
}

#[cfg(unix)]
/// Bind a listening unix socket at `path`, removing a stale socket file
/// left behind by a prior crashed server first.
pub fn listen_unix(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    UnixListener::bind(path)
}

/// Accept connections from `listener` forever, handing each one to
/// `handler` on its own thread. Mirrors the teacher's per-connection
/// thread-per-client model: a stuck client only ever blocks its own
/// thread.
pub fn serve_tcp(
    listener: TcpListener,
    handler: impl Fn(Box<dyn DuplexStream>) + Send + Sync + 'static,
) {
    let handler = Arc::new(handler);
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let handler = Arc::clone(&handler);
                thread::spawn(move || handler(Box::new(stream)));
            }
            Err(e) => warn!(error = %e, "accepting tcp connection"),
        }
    }
}

#[cfg(unix)]
pub fn serve_unix(
    listener: UnixListener,
    handler: impl Fn(Box<dyn DuplexStream>) + Send + Sync + 'static,
) {
    let handler = Arc::new(handler);
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let handler = Arc::clone(&handler);
                thread::spawn(move || handler(Box::new(stream)));
            }
            Err(e) => warn!(error = %e, "accepting unix connection"),
        }
    }
}

#[cfg(unix)]
/// Repeatedly attempt to dial a unix socket (e.g. a VM's virtio-serial
/// device) until it succeeds or `shutdown` is set, backing off by
/// [`consts::DIAL_RETRY_INTERVAL`] between attempts. Once connected, the
/// connection is handed to `handler`; when `handler` returns (the peer
/// disconnected), dialing resumes so a rebooted VM is picked back up
/// automatically.
pub fn dial_unix_loop(
    path: PathBuf,
    shutdown: Arc<AtomicBool>,
    handler: impl Fn(Box<dyn DuplexStream>) + Send + Sync + 'static,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match UnixStream::connect(&path) {
            Ok(stream) => {
                info!(path = %path.display(), "dialed unix socket");
                handler(Box::new(stream));
            }
            Err(_) => {
                thread::sleep(consts::DIAL_RETRY_INTERVAL);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn version_header_round_trips_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            exchange_version_header(&mut stream).unwrap();
        });

        let mut client = TcpStream::connect(addr).unwrap();
        exchange_version_header(&mut client).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn duplex_stream_clone_shares_the_same_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            buf
        });
        let mut client = TcpStream::connect(addr).unwrap();
        let mut clone = client.try_clone_box().unwrap();
        clone.write_all(b"hello").unwrap();
        let received = server.join().unwrap();
        assert_eq!(&received, b"hello");
        drop(client);
    }
}
