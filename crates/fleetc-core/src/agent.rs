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

//! The agent core (spec §4.10): what runs inside every managed
//! VM/container. Tracks a local command-id watermark, executes
//! dispatched commands, and reports results back on the next
//! heartbeat.

use std::{
    collections::HashMap,
    io::{Read, Write},
    process::{Child, ChildStdin, Command as ProcessCommand, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

#[cfg(unix)]
use std::os::unix::process::CommandExt;

#[cfg(unix)]
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};

use crossbeam_channel::Sender;
use fleetc_protocol::{ClientInfo, Command, LogLevel, Message, PipeFrame, PipeMode, Response};
use tracing::{info, instrument, warn};
use tracing_subscriber::{filter::LevelFilter, reload};

/// A backgrounded child process the agent is still tracking, so a later
/// `killall`/`pid == -1` signal can reach it.
struct TrackedChild {
    pid: i32,
    name: String,
    child: Child,
}

/// Agent-local state: the identity it advertises, its watermark of the
/// highest command id it has ever executed, the queue of responses
/// waiting to ride out on the next heartbeat, and the backgrounded child
/// processes/named pipes it's still responsible for.
pub struct AgentState {
    pub identity: Mutex<ClientInfo>,
    max_command_id: AtomicU64,
    pending_responses: Mutex<Vec<Response>>,
    log_level_handle: Option<reload::Handle<LevelFilter, tracing_subscriber::registry::Registry>>,
    children: Mutex<Vec<TrackedChild>>,
    pipe_writers: Mutex<HashMap<String, ChildStdin>>,
    outbound: Mutex<Option<Sender<Message>>>,
}

impl AgentState {
    pub fn new(identity: ClientInfo, log_level_handle: Option<reload::Handle<LevelFilter, tracing_subscriber::registry::Registry>>) -> AgentState {
        let max_command_id = identity.command_counter;
        AgentState {
            identity: Mutex::new(identity),
            max_command_id: AtomicU64::new(max_command_id),
            pending_responses: Mutex::new(Vec::new()),
            log_level_handle,
            children: Mutex::new(Vec::new()),
            pipe_writers: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
        }
    }

    pub fn max_command_id(&self) -> u64 {
        self.max_command_id.load(Ordering::Relaxed)
    }

    /// Set the sending half of the current connection's outbound queue,
    /// used to forward named-pipe stdio (spec §4.10). Replaced on every
    /// reconnect.
    pub fn set_outbound(&self, tx: Sender<Message>) {
        *self.outbound.lock().unwrap() = Some(tx);
    }

    /// Adopt the namespace the server resolved and echoed back at
    /// handshake time (spec §4.3 step 3).
    pub fn adopt_namespace(&self, namespace: String) {
        self.identity.lock().unwrap().namespace = namespace;
    }

    /// Route an inbound `PIPE` frame to the matching local writer (the
    /// operator is writing to this command's stdin), closing and
    /// dropping it on `Close`.
    pub fn handle_pipe_frame(&self, frame: PipeFrame) {
        match frame.mode {
            PipeMode::Data => {
                let mut writers = self.pipe_writers.lock().unwrap();
                if let Some(writer) = writers.get_mut(&frame.name) {
                    if writer.write_all(&frame.data).is_err() {
                        writers.remove(&frame.name);
                    }
                }
            }
            PipeMode::Close => {
                self.pipe_writers.lock().unwrap().remove(&frame.name);
            }
            PipeMode::Open => {}
        }
    }

    /// Build the `CLIENT` message payload for the next heartbeat: the
    /// current identity snapshot plus every response queued since the
    /// last one, which are drained on success.
    pub fn drain_heartbeat_payload(&self) -> (ClientInfo, Vec<Response>) {
        let mut identity = self.identity.lock().unwrap().clone();
        identity.command_counter = self.max_command_id();
        let responses = std::mem::take(&mut *self.pending_responses.lock().unwrap());
        (identity, responses)
    }

    /// Execute every command in `commands` that is both unseen (id
    /// greater than our own watermark) and matches our own identity
    /// against its filter (spec §4.10: the agent re-checks locally
    /// rather than trusting the server already filtered correctly),
    /// queueing a [`Response`] for each one it actually runs and
    /// advancing the watermark as it goes so a restart replay never
    /// executes the same id twice.
    #[instrument(skip_all)]
    pub fn execute_batch(&self, commands: std::collections::BTreeMap<u64, Command>) {
        let identity = self.identity.lock().unwrap().clone();
        for (id, command) in commands {
            if id <= self.max_command_id() {
                continue;
            }
            self.max_command_id.fetch_max(id, Ordering::Relaxed);

            if let Some(f) = &command.filter {
                if !f.is_empty() && !crate::filter::matches(f, &identity) {
                    continue;
                }
            }

            let response = self.execute_one(id, &command);
            self.pending_responses.lock().unwrap().push(response);
        }
    }

    fn execute_one(&self, id: u64, command: &Command) -> Response {
        if let Some(level) = command.level {
            self.apply_log_level(level);
        }
        if command.pid != 0 {
            self.signal_pid(command.pid);
        }
        if !command.killall.is_empty() {
            self.killall(&command.killall);
        }
        if !command.argv.is_empty() {
            return self.run_argv(id, command);
        }
        Response { id, ..Default::default() }
    }

    fn run_argv(&self, id: u64, command: &Command) -> Response {
        let mut proc = ProcessCommand::new(&command.argv[0]);
        proc.args(&command.argv[1..]);
        proc.stdin(if command.stdin.is_some() { Stdio::piped() } else { Stdio::null() });
        proc.stdout(Stdio::piped());
        proc.stderr(Stdio::piped());
        // Spawn into its own process group so a later signal_pid/killall
        // can target the whole group rather than just this one pid.
        #[cfg(unix)]
        proc.process_group(0);

        let mut child = match proc.spawn() {
            Ok(child) => child,
            Err(e) => return Response { id, stderr: format!("exec failed: {e}").into_bytes(), ..Default::default() },
        };
        let pid = child.id() as i32;

        if let (Some(name), Some(stdin)) = (&command.stdin, child.stdin.take()) {
            self.pipe_writers.lock().unwrap().insert(name.clone(), stdin);
        }
        let stdout_sink = self.wire_output_stream(command.stdout.clone(), child.stdout.take());
        let stderr_sink = self.wire_output_stream(command.stderr.clone(), child.stderr.take());

        if command.background {
            let name = argv0_basename(&command.argv);
            self.track_child(TrackedChild { pid, name, child });
            return Response { id, ..Default::default() };
        }

        let _ = child.wait();
        let stdout = stdout_sink.join().unwrap_or_default();
        let stderr = stderr_sink.join().unwrap_or_default();
        Response { id, stdout, stderr, files: Vec::new() }
    }

    /// Either forward a child's output stream to a named pipe over the
    /// current outbound connection (if the command named one) or
    /// capture it in-process for the eventual [`Response`]. Runs on its
    /// own thread so stdout/stderr can be drained concurrently with the
    /// child running; joins return the captured bytes (empty when
    /// forwarding to a pipe instead).
    fn wire_output_stream(
        &self,
        pipe_name: Option<String>,
        stream: Option<impl Read + Send + 'static>,
    ) -> std::thread::JoinHandle<Vec<u8>> {
        let outbound = self.outbound.lock().unwrap().clone();
        let uuid = self.identity.lock().unwrap().uuid.clone();
        std::thread::spawn(move || {
            let Some(mut stream) = stream else { return Vec::new() };
            match (pipe_name, outbound) {
                (Some(name), Some(outbound)) => {
                    let mut buf = [0u8; 8192];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let msg = Message::Pipe {
                                    uuid: Some(uuid.clone()),
                                    error: String::new(),
                                    pipe: PipeFrame { name: name.clone(), mode: PipeMode::Data, data: buf[..n].to_vec() },
                                };
                                if outbound.send(msg).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    let _ = outbound.send(Message::Pipe {
                        uuid: Some(uuid),
                        error: String::new(),
                        pipe: PipeFrame { name, mode: PipeMode::Close, data: Vec::new() },
                    });
                    Vec::new()
                }
                _ => {
                    let mut buf = Vec::new();
                    let _ = stream.read_to_end(&mut buf);
                    buf
                }
            }
        })
    }

    fn track_child(&self, child: TrackedChild) {
        self.prune_finished_children();
        self.children.lock().unwrap().push(child);
    }

    fn prune_finished_children(&self) {
        self.children.lock().unwrap().retain_mut(|c| !matches!(c.child.try_wait(), Ok(Some(_))));
    }

    #[cfg(unix)]
    fn signal_pid(&self, pid: i64) {
        if pid < 0 {
            self.prune_finished_children();
            for c in self.children.lock().unwrap().iter() {
                match killpg(Pid::from_raw(c.pid), Signal::SIGTERM) {
                    Ok(()) => info!(pid = c.pid, "sent SIGTERM to tracked child group"),
                    Err(e) => warn!(pid = c.pid, error = %e, "failed to signal tracked child group"),
                }
            }
            return;
        }
        match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => info!(pid, "sent SIGTERM to process group"),
            Err(e) => warn!(pid, error = %e, "failed to signal process group"),
        }
    }

    #[cfg(not(unix))]
    fn signal_pid(&self, pid: i64) {
        warn!(pid, "signal delivery is only supported on unix");
    }

    #[cfg(unix)]
    fn killall(&self, prefix: &str) {
        self.prune_finished_children();
        for c in self.children.lock().unwrap().iter() {
            if !c.name.starts_with(prefix) {
                continue;
            }
            match killpg(Pid::from_raw(c.pid), Signal::SIGTERM) {
                Ok(()) => info!(pid = c.pid, name = %c.name, "sent SIGTERM via killall"),
                Err(e) => warn!(pid = c.pid, name = %c.name, error = %e, "failed to signal via killall"),
            }
        }
    }

    #[cfg(not(unix))]
    fn killall(&self, prefix: &str) {
        warn!(prefix, "killall is only supported on unix");
    }

    fn apply_log_level(&self, level: LogLevel) {
        let Some(handle) = &self.log_level_handle else { return };
        let filter = match level {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        };
        if let Err(e) = handle.modify(|f| *f = filter) {
            warn!(error = %e, "failed to apply log level change");
        }
    }
}

fn argv0_basename(argv: &[String]) -> String {
    argv.first()
        .map(|a| a.rsplit('/').next().unwrap_or(a).to_string())
        .unwrap_or_default()
}
