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

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};
use serde::{Deserialize, Serialize};

/// A message larger than this is almost certainly a corrupted length
/// prefix rather than a legitimate payload; refuse to allocate for it.
const MAX_MESSAGE_LEN: u32 = 256 * 1024 * 1024;

/// Errors the codec surfaces that callers need to branch on (spec §7):
/// a clean peer close is not the same failure as a reset connection,
/// and neither is the same as a payload that failed to decode.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("peer closed the connection cleanly")]
    TransportEof,
    #[error("connection reset by peer")]
    TransportReset,
    #[error("message exceeds maximum length ({0} bytes)")]
    TooLarge(u32),
    #[error("failed to decode message: {0}")]
    Decode(#[from] Box<bincode::ErrorKind>),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    fn from_io(e: io::Error) -> CodecError {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => CodecError::TransportEof,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                CodecError::TransportReset
            }
            _ => CodecError::Io(e),
        }
    }
}

/// The centralized encoding function that should be used for all
/// protocol serialization. Writes a 4-byte little-endian length prefix
/// followed by the bincode-encoded value, mirroring
/// `libshpool::protocol::encode_to` but with framing on top since
/// bincode (unlike msgpack) is not self-delimiting.
pub fn encode_to<T, W>(value: &T, mut w: W) -> Result<(), CodecError>
where
    T: Serialize,
    W: Write,
{
    let payload = bincode::serialize(value)?;
    if payload.len() as u64 > MAX_MESSAGE_LEN as u64 {
        return Err(CodecError::TooLarge(payload.len() as u32));
    }
    w.write_u32::<LittleEndian>(payload.len() as u32).map_err(CodecError::from_io)?;
    w.write_all(&payload).map_err(CodecError::from_io)?;
    Ok(())
}

/// The centralized decoding function that should be used for all
/// protocol deserialization.
pub fn decode_from<T, R>(mut r: R) -> Result<T, CodecError>
where
    for<'de> T: Deserialize<'de>,
    R: Read,
{
    let len = r.read_u32::<LittleEndian>().map_err(CodecError::from_io)?;
    if len > MAX_MESSAGE_LEN {
        return Err(CodecError::TooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).map_err(CodecError::from_io)?;
    let value = bincode::deserialize(&buf)?;
    Ok(value)
}
