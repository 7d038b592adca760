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

//! End-to-end scenarios driving a real [`Server`] over loopback TCP, a
//! raw socket standing in for the agent side. Exercises the handshake,
//! filtered dispatch, response persistence, and disconnect cleanup
//! together rather than unit-by-unit.

use std::{net::TcpStream, sync::Arc, thread, time::Duration};

use fleetc_core::{
    command::CommandStore, dispatcher::Dispatcher, registry::Registry, response::ResponseHandler,
    server::Server, transport, vm_registry::InMemoryVmRegistry,
};
use fleetc_protocol::{decode_from, encode_to, ClientInfo, Command, Filter, Message, Response};

struct Harness {
    server: Server,
    addr: std::net::SocketAddr,
    commands: Arc<CommandStore>,
    vm_registry: Arc<InMemoryVmRegistry>,
}

fn start_server(content_root: &std::path::Path) -> Harness {
    let registry = Registry::new();
    let commands = Arc::new(CommandStore::new());
    let dispatcher = Dispatcher::new(registry.clone(), commands.clone());
    let vm_registry = Arc::new(InMemoryVmRegistry::new());
    let response_handler = ResponseHandler::new(
        registry.clone(),
        commands.clone(),
        vm_registry.clone(),
        content_root.to_path_buf(),
    );

    let server = Server {
        registry,
        dispatcher,
        response_handler,
        vm_registry: vm_registry.clone(),
        content_root: content_root.to_path_buf(),
        file_chunk_size: 64 * 1024,
    };

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_server = server.clone();
    thread::spawn(move || {
        transport::serve_tcp(listener, move |stream| accept_server.handle_connection(stream));
    });

    Harness { server, addr, commands, vm_registry }
}

fn connect_agent(addr: std::net::SocketAddr, uuid: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).unwrap();
    transport::exchange_version_header(&mut stream).unwrap();
    let client = ClientInfo { uuid: uuid.to_string(), ..Default::default() };
    encode_to(
        &Message::Client { uuid: Some(uuid.to_string()), error: String::new(), client, responses: Vec::new() },
        &mut stream,
    )
    .unwrap();

    // A successful handshake earns a Message::Client echo back with the
    // resolved namespace; drain it here so every other read in the test
    // sees only the payload it's actually asserting on. When the
    // handshake is rejected (unknown uuid) the connection is simply
    // closed and this read fails fast instead.
    stream.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    let _: Result<Message, _> = decode_from(&mut stream);
    stream.set_read_timeout(None).unwrap();
    stream
}

#[test]
fn handshake_rejects_clients_unknown_to_the_vm_registry() {
    let dir = tempfile::tempdir().unwrap();
    let h = start_server(dir.path());
    // no register() call for this uuid, so the handshake must fail and
    // the client must never show up in the registry
    let _stream = connect_agent(h.addr, "unregistered");

    thread::sleep(Duration::from_millis(200));
    assert!(!h.server.registry.contains("unregistered"));
}

#[test]
fn registered_client_receives_filtered_commands_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let h = start_server(dir.path());
    h.vm_registry.register("linux-1", "ns-a");
    h.vm_registry.register("win-1", "ns-b");

    let mut linux = connect_agent(h.addr, "linux-1");
    let mut win = connect_agent(h.addr, "win-1");
    thread::sleep(Duration::from_millis(150));
    h.server.registry.with("linux-1", |c| c.os = "linux".to_string());
    h.server.registry.with("win-1", |c| c.os = "windows".to_string());

    h.commands.new_command(Command {
        filter: Some(Filter { os: Some("linux".to_string()), ..Default::default() }),
        argv: vec!["echo".to_string(), "hi".to_string()],
        ..Default::default()
    });
    h.server.dispatcher.dispatch_all();

    linux.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let msg: Message = decode_from(&mut linux).unwrap();
    assert!(matches!(msg, Message::Command { .. }));

    win.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    let result: Result<Message, _> = decode_from(&mut win);
    assert!(result.is_err(), "a windows client must not receive a linux-filtered command");
}

#[test]
fn response_round_trip_persists_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let h = start_server(dir.path());
    h.vm_registry.register("agent-1", "ns-a");

    let mut stream = connect_agent(h.addr, "agent-1");
    thread::sleep(Duration::from_millis(100));
    let id = h.commands.new_command(Command::default());
    h.server.dispatcher.dispatch_all();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let _initial: Message = decode_from(&mut stream).unwrap();

    let response = Response { id, stdout: b"it worked".to_vec(), ..Default::default() };
    let client = ClientInfo { uuid: "agent-1".to_string(), command_counter: id, ..Default::default() };
    encode_to(
        &Message::Client { uuid: Some("agent-1".to_string()), error: String::new(), client, responses: vec![response] },
        &mut stream,
    )
    .unwrap();

    thread::sleep(Duration::from_millis(300));
    let stdout_path = dir.path().join("responses").join(id.to_string()).join("agent-1").join("stdout");
    assert_eq!(std::fs::read(stdout_path).unwrap(), b"it worked");
}

#[test]
fn disconnect_removes_client_from_registry() {
    let dir = tempfile::tempdir().unwrap();
    let h = start_server(dir.path());
    h.vm_registry.register("agent-1", "ns-a");

    let stream = connect_agent(h.addr, "agent-1");
    thread::sleep(Duration::from_millis(100));
    assert!(h.server.registry.contains("agent-1"));

    drop(stream);
    thread::sleep(Duration::from_millis(300));
    assert!(!h.server.registry.contains("agent-1"));
}
