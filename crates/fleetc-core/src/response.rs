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

//! The response handler (spec §4.7): ingests a `CLIENT` message's
//! heartbeat and attached responses, persisting each to
//! `<content_root>/responses/<command id>/<client uuid>/`.

use std::{fs, path::{Path, PathBuf}, sync::Arc};

use fleetc_protocol::{ClientInfo, Response};
use tracing::{debug, instrument, warn};

use crate::{command::CommandStore, registry::Registry, vm_registry::VmRegistry};

/// Ties a [`Registry`] and [`CommandStore`] to a filesystem root for
/// persisting responses, plus the VM registry so advertised tags flow
/// back into a client's external registration record.
#[derive(Clone)]
pub struct ResponseHandler {
    registry: Registry,
    commands: std::sync::Arc<CommandStore>,
    vm_registry: Arc<dyn VmRegistry>,
    content_root: PathBuf,
}

impl ResponseHandler {
    pub fn new(
        registry: Registry,
        commands: std::sync::Arc<CommandStore>,
        vm_registry: Arc<dyn VmRegistry>,
        content_root: impl Into<PathBuf>,
    ) -> ResponseHandler {
        ResponseHandler { registry, commands, vm_registry, content_root: content_root.into() }
    }

    /// Handle one incoming `CLIENT` message: refresh the client's
    /// liveness/command-counter bookkeeping (if it's still registered —
    /// spec §4.7 says responses are still ingested even if it raced a
    /// disconnect), push its advertised tags into the VM registry, and
    /// persist every attached response.
    #[instrument(skip_all, fields(uuid = %info.uuid))]
    pub fn handle_client_message(&self, info: &ClientInfo, responses: &[Response]) {
        let updated = self.registry.with(&info.uuid, |c| {
            c.touch();
            // The agent's own counter only ever grows; if it tells us a
            // higher watermark than we had (e.g. after an agent
            // restart that replayed old commands), trust it so we don't
            // keep re-sending commands it has already executed.
            if info.command_counter > c.max_command_id {
                c.max_command_id = info.command_counter;
            }
            c.tags = info.tags.clone();
        });
        if updated.is_none() {
            debug!("response for unregistered client, ingesting without updating registry");
        }

        if let Some(handle) = self.vm_registry.lookup(&info.uuid) {
            for (k, v) in &info.tags {
                handle.set_tag(k, v);
            }
        }

        for response in responses {
            self.persist_response(&info.uuid, response);
        }
    }

    fn persist_response(&self, uuid: &str, response: &Response) {
        self.commands.mark_checked_in(response.id, uuid);

        let dir = self.response_dir(response.id, uuid);
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!(error = %e, dir = %dir.display(), "failed to create response directory");
            return;
        }

        if !response.stdout.is_empty() {
            let target = dir.join("stdout");
            match fs::write(&target, &response.stdout) {
                Ok(()) => set_response_file_perm(&target),
                Err(e) => warn!(error = %e, "failed to persist stdout"),
            }
        }
        if !response.stderr.is_empty() {
            let target = dir.join("stderr");
            match fs::write(&target, &response.stderr) {
                Ok(()) => set_response_file_perm(&target),
                Err(e) => warn!(error = %e, "failed to persist stderr"),
            }
        }
        for file in &response.files {
            if let Err(e) = self.persist_response_file(&dir, file) {
                warn!(error = %e, rel_path = %file.rel_path, "failed to persist response file, continuing with the rest");
            }
        }
    }

    fn persist_response_file(&self, dir: &Path, file: &fleetc_protocol::ResponseFile) -> std::io::Result<()> {
        let target = dir.join(sanitize_rel_path(&file.rel_path));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &file.data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perm = std::fs::Permissions::from_mode(file.perm);
            fs::set_permissions(&target, perm)?;
        }
        Ok(())
    }

    fn response_dir(&self, command_id: u64, uuid: &str) -> PathBuf {
        self.content_root.join("responses").join(command_id.to_string()).join(uuid)
    }
}

/// `stdout`/`stderr` files are written `0660` (spec §4.7), unlike
/// response files proper which carry their own `perm` from the agent.
#[cfg(unix)]
fn set_response_file_perm(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, std::fs::Permissions::from_mode(0o660)) {
        warn!(error = %e, path = %path.display(), "failed to set response file permissions");
    }
}

#[cfg(not(unix))]
fn set_response_file_perm(_path: &Path) {}

/// Strip any leading `/` or `..` components so a malicious/buggy rel
/// path can never escape the response directory.
fn sanitize_rel_path(rel_path: &str) -> PathBuf {
    rel_path
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
        .collect()
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use fleetc_protocol::{ClientInfo, Response, ResponseFile};
    use tempfile::tempdir;

    use super::*;
    use crate::{command::CommandStore, vm_registry::InMemoryVmRegistry};

    fn register(registry: &Registry, uuid: &str) {
        let (tx, _rx) = crossbeam_channel::unbounded();
        registry.insert(ClientInfo { uuid: uuid.to_string(), ..Default::default() }, tx);
    }

    fn vm_registry() -> Arc<InMemoryVmRegistry> {
        Arc::new(InMemoryVmRegistry::new())
    }

    #[test]
    fn persists_stdout_stderr_and_files() {
        let dir = tempdir().unwrap();
        let registry = Registry::new();
        register(&registry, "c1");
        let commands = std::sync::Arc::new(CommandStore::new());
        let id = commands.new_command(Default::default());
        let handler = ResponseHandler::new(registry, commands.clone(), vm_registry(), dir.path());

        let response = Response {
            id,
            stdout: b"hello".to_vec(),
            stderr: b"err".to_vec(),
            files: vec![ResponseFile { rel_path: "out.txt".to_string(), perm: 0o644, data: b"data".to_vec() }],
        };
        handler.handle_client_message(
            &ClientInfo { uuid: "c1".to_string(), tags: HashMap::new(), ..Default::default() },
            &[response],
        );

        let base = dir.path().join("responses").join(id.to_string()).join("c1");
        assert_eq!(fs::read(base.join("stdout")).unwrap(), b"hello");
        assert_eq!(fs::read(base.join("stderr")).unwrap(), b"err");
        assert_eq!(fs::read(base.join("out.txt")).unwrap(), b"data");
    }

    #[test]
    fn empty_stdout_and_stderr_produce_no_files() {
        let dir = tempdir().unwrap();
        let registry = Registry::new();
        register(&registry, "c1");
        let commands = std::sync::Arc::new(CommandStore::new());
        let id = commands.new_command(Default::default());
        let handler = ResponseHandler::new(registry, commands.clone(), vm_registry(), dir.path());

        handler.handle_client_message(
            &ClientInfo { uuid: "c1".to_string(), ..Default::default() },
            &[Response { id, ..Default::default() }],
        );

        let base = dir.path().join("responses").join(id.to_string()).join("c1");
        assert!(!base.join("stdout").exists());
        assert!(!base.join("stderr").exists());
    }

    #[test]
    fn marks_command_checked_in() {
        let dir = tempdir().unwrap();
        let registry = Registry::new();
        register(&registry, "c1");
        let commands = std::sync::Arc::new(CommandStore::new());
        let id = commands.new_command(Default::default());
        let handler = ResponseHandler::new(registry, commands.clone(), vm_registry(), dir.path());

        handler.handle_client_message(
            &ClientInfo { uuid: "c1".to_string(), ..Default::default() },
            &[Response { id, ..Default::default() }],
        );

        let record = commands.get_command(id).unwrap();
        assert!(record.checked_in.contains("c1"));
    }

    #[test]
    fn response_for_unregistered_client_is_still_ingested() {
        let dir = tempdir().unwrap();
        let registry = Registry::new();
        let commands = std::sync::Arc::new(CommandStore::new());
        let id = commands.new_command(Default::default());
        let handler = ResponseHandler::new(registry, commands.clone(), vm_registry(), dir.path());

        handler.handle_client_message(
            &ClientInfo { uuid: "ghost".to_string(), ..Default::default() },
            &[Response { id, stdout: b"x".to_vec(), ..Default::default() }],
        );

        let base = dir.path().join("responses").join(id.to_string()).join("ghost");
        assert_eq!(fs::read(base.join("stdout")).unwrap(), b"x");
    }

    #[test]
    fn response_for_unknown_command_does_not_panic_and_still_writes() {
        let dir = tempdir().unwrap();
        let registry = Registry::new();
        register(&registry, "c1");
        let commands = std::sync::Arc::new(CommandStore::new());
        let handler = ResponseHandler::new(registry, commands, vm_registry(), dir.path());

        handler.handle_client_message(
            &ClientInfo { uuid: "c1".to_string(), ..Default::default() },
            &[Response { id: 999, stdout: b"x".to_vec(), ..Default::default() }],
        );
        let base = dir.path().join("responses").join("999").join("c1");
        assert!(base.join("stdout").exists());
    }

    #[test]
    fn sanitizes_path_traversal_in_rel_path() {
        assert_eq!(sanitize_rel_path("../../etc/passwd"), PathBuf::from("etc/passwd"));
        assert_eq!(sanitize_rel_path("/abs/path"), PathBuf::from("abs/path"));
    }
}
