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

//! The chunked file transport (spec §4.8): both `files_send`/
//! `files_recv` command-triggered transfers and the file-get plane
//! share this sender/receiver pair.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use fleetc_protocol::FileChunk;

use crate::error::FleetError;

/// Splits a file on disk into a sequence of [`FileChunk`]s with
/// monotonically increasing offsets, the last one carrying `eof: true`.
#[derive(Debug)]
pub struct ChunkSender {
    file: File,
    id: u64,
    name: String,
    perm: u32,
    offset: u64,
    chunk_size: usize,
}

impl ChunkSender {
    pub fn open(id: u64, path: &Path, chunk_size: usize) -> Result<ChunkSender, FleetError> {
        let meta = fs::metadata(path).map_err(|e| io_err(path, e))?;
        if meta.is_dir() {
            return Err(FleetError::FileIsDir(path.display().to_string()));
        }
        let file = File::open(path).map_err(|e| io_err(path, e))?;
        let perm = file_perm(&meta);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(ChunkSender { file, id, name, perm, offset: 0, chunk_size })
    }

    /// Read and return the next chunk, or `None` once EOF has already
    /// been emitted.
    pub fn next_chunk(&mut self) -> Result<Option<FileChunk>, FleetError> {
        let mut buf = vec![0u8; self.chunk_size];
        let n = self.file.read(&mut buf).map_err(|e| FleetError::FileIo { path: self.name.clone(), source: e })?;
        buf.truncate(n);
        let offset = self.offset;
        self.offset += n as u64;

        if n == 0 {
            return Ok(None);
        }

        // peek ahead without consuming: if the next byte is unavailable
        // we're at eof after this chunk.
        let mut probe = [0u8; 1];
        let more = self.file.read(&mut probe).map_err(|e| FleetError::FileIo { path: self.name.clone(), source: e })? > 0;
        if more {
            self.file.seek(SeekFrom::Current(-1)).map_err(|e| FleetError::FileIo { path: self.name.clone(), source: e })?;
        }

        Ok(Some(FileChunk {
            id: self.id,
            name: self.name.clone(),
            perm: self.perm,
            offset,
            data: buf,
            eof: !more,
        }))
    }
}

/// Accumulates incoming [`FileChunk`]s into `<dest_dir>/<name>.partial`,
/// renaming to the final name only once the `eof` chunk lands (spec
/// §4.8/§5's crash-safety rationale: a reader never observes a
/// half-written file under the final name).
pub struct ChunkReceiver {
    dest_dir: PathBuf,
    next_offset: u64,
}

impl ChunkReceiver {
    pub fn new(dest_dir: impl Into<PathBuf>) -> ChunkReceiver {
        ChunkReceiver { dest_dir: dest_dir.into(), next_offset: 0 }
    }

    /// Apply one chunk. Returns `Ok(true)` once the file is complete
    /// (the `.partial` file has been renamed into place).
    pub fn accept(&mut self, chunk: &FileChunk) -> Result<bool, FleetError> {
        if chunk.offset != self.next_offset {
            return Err(FleetError::FileIo {
                path: chunk.name.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("out-of-order chunk: expected offset {}, got {}", self.next_offset, chunk.offset),
                ),
            });
        }

        fs::create_dir_all(&self.dest_dir).map_err(|e| io_err(&self.dest_dir, e))?;
        let partial = self.partial_path(&chunk.name);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&partial)
            .map_err(|e| io_err(&partial, e))?;
        file.seek(SeekFrom::Start(chunk.offset)).map_err(|e| io_err(&partial, e))?;
        file.write_all(&chunk.data).map_err(|e| io_err(&partial, e))?;
        drop(file);

        self.next_offset += chunk.data.len() as u64;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perm = fs::Permissions::from_mode(chunk.perm);
            fs::set_permissions(&partial, perm).map_err(|e| io_err(&partial, e))?;
        }

        if chunk.eof {
            let dest = self.dest_dir.join(&chunk.name);
            fs::rename(&partial, &dest).map_err(|e| io_err(&dest, e))?;
            return Ok(true);
        }
        Ok(false)
    }

    fn partial_path(&self, name: &str) -> PathBuf {
        self.dest_dir.join(format!("{name}.partial"))
    }
}

fn io_err(path: &Path, source: std::io::Error) -> FleetError {
    if source.kind() == std::io::ErrorKind::NotFound {
        return FleetError::FileNotFound(path.display().to_string());
    }
    FleetError::FileIo { path: path.display().to_string(), source }
}

#[cfg(unix)]
fn file_perm(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_perm(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

#[cfg(test)]
mod test {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn round_trip_single_chunk() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.txt");
        fs::write(&src, b"hello world").unwrap();

        let mut sender = ChunkSender::open(1, &src, 4096).unwrap();
        let chunk = sender.next_chunk().unwrap().unwrap();
        assert!(chunk.eof);
        assert!(sender.next_chunk().unwrap().is_none());

        let dest = dir.path().join("out");
        let mut receiver = ChunkReceiver::new(&dest);
        assert!(receiver.accept(&chunk).unwrap());
        assert_eq!(fs::read(dest.join("a.txt")).unwrap(), b"hello world");
        assert!(!dest.join("a.txt.partial").exists());
    }

    #[test]
    fn round_trip_multi_chunk() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("b.txt");
        fs::write(&src, vec![b'x'; 10]).unwrap();

        let mut sender = ChunkSender::open(2, &src, 3).unwrap();
        let dest = dir.path().join("out");
        let mut receiver = ChunkReceiver::new(&dest);
        let mut done = false;
        while let Some(chunk) = sender.next_chunk().unwrap() {
            done = receiver.accept(&chunk).unwrap();
        }
        assert!(done);
        assert_eq!(fs::read(dest.join("b.txt")).unwrap(), vec![b'x'; 10]);
    }

    #[test]
    fn refuses_to_send_a_directory() {
        let dir = tempdir().unwrap();
        let err = ChunkSender::open(1, dir.path(), 4096).unwrap_err();
        assert!(matches!(err, FleetError::FileIsDir(_)));
    }

    #[test]
    fn out_of_order_chunk_is_rejected() {
        let dir = tempdir().unwrap();
        let mut receiver = ChunkReceiver::new(dir.path().join("out"));
        let chunk = FileChunk { id: 1, name: "f".to_string(), perm: 0o644, offset: 5, data: b"x".to_vec(), eof: true };
        assert!(receiver.accept(&chunk).is_err());
    }

    #[test]
    fn partial_file_not_visible_under_final_name_until_eof() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out");
        let mut receiver = ChunkReceiver::new(&dest);
        let chunk = FileChunk { id: 1, name: "f".to_string(), perm: 0o644, offset: 0, data: b"partial".to_vec(), eof: false };
        assert!(!receiver.accept(&chunk).unwrap());
        assert!(!dest.join("f").exists());
        assert!(dest.join("f.partial").exists());
    }
}
