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

//! The registration interface to the external VM/experiment
//! orchestrator named in spec §6. That orchestrator itself is out of
//! scope (spec §1); this module only defines the seam and a usable
//! in-memory stand-in so the server can run standalone and be tested.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// A handle to a single VM's registration record.
pub trait VmHandle: Send + Sync {
    fn get_tags(&self) -> HashMap<String, String>;
    fn set_tag(&self, key: &str, value: &str);
    fn get_namespace(&self) -> String;
    fn set_cc_active(&self, active: bool);
}

/// The registration API external orchestrators implement against (spec
/// §6's `RegisterVM`/`UnregisterVM`).
pub trait VmRegistry: Send + Sync {
    fn register_vm(&self, uuid: &str, handle: Arc<dyn VmHandle>);
    fn unregister_vm(&self, uuid: &str);
    /// Look up a VM's handle by the UUID the agent advertised at
    /// handshake time. Returns `None` if no orchestrator has registered
    /// that UUID (possibly because it needs UUID-unmangling first; the
    /// registry handler tries both forms per spec §9).
    fn lookup(&self, uuid: &str) -> Option<Arc<dyn VmHandle>>;
}

#[derive(Default)]
struct InMemoryHandleState {
    tags: HashMap<String, String>,
    namespace: String,
    cc_active: bool,
}

struct InMemoryHandle {
    state: Mutex<InMemoryHandleState>,
}

impl VmHandle for InMemoryHandle {
    fn get_tags(&self) -> HashMap<String, String> {
        self.state.lock().unwrap().tags.clone()
    }

    fn set_tag(&self, key: &str, value: &str) {
        self.state.lock().unwrap().tags.insert(key.to_string(), value.to_string());
    }

    fn get_namespace(&self) -> String {
        self.state.lock().unwrap().namespace.clone()
    }

    fn set_cc_active(&self, active: bool) {
        self.state.lock().unwrap().cc_active = active;
    }
}

/// An in-memory [`VmRegistry`] sufficient for standalone operation and
/// integration tests. Every UUID presented at `register_vm` is accepted
/// unconditionally, with a namespace derived from the UUID's first
/// hyphen-delimited group (a stand-in for whatever real scheme the
/// orchestrator uses).
#[derive(Default)]
pub struct InMemoryVmRegistry {
    handles: Mutex<HashMap<String, Arc<dyn VmHandle>>>,
}

impl InMemoryVmRegistry {
    pub fn new() -> Self {
        InMemoryVmRegistry { handles: Mutex::new(HashMap::new()) }
    }

    /// Convenience used by tests and by the server's own bootstrap to
    /// pre-register a VM with a specific namespace before an agent ever
    /// connects, mirroring how an external orchestrator would call
    /// `RegisterVM` ahead of boot.
    pub fn register(&self, uuid: &str, namespace: &str) {
        let handle = Arc::new(InMemoryHandle {
            state: Mutex::new(InMemoryHandleState {
                tags: HashMap::new(),
                namespace: namespace.to_string(),
                cc_active: false,
            }),
        });
        self.handles.lock().unwrap().insert(uuid.to_lowercase(), handle);
    }
}

impl VmRegistry for InMemoryVmRegistry {
    fn register_vm(&self, uuid: &str, handle: Arc<dyn VmHandle>) {
        self.handles.lock().unwrap().insert(uuid.to_lowercase(), handle);
    }

    fn unregister_vm(&self, uuid: &str) {
        self.handles.lock().unwrap().remove(&uuid.to_lowercase());
    }

    fn lookup(&self, uuid: &str) -> Option<Arc<dyn VmHandle>> {
        self.handles.lock().unwrap().get(&uuid.to_lowercase()).cloned()
    }
}
