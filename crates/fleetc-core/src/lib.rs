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

//! The dispatch, transport, and coordination layer of the fleetctl
//! command-and-control fabric. Everything here is shared by the
//! `fleetc-serverd` and `fleetc-agent` binaries; neither binary
//! contains logic of its own beyond CLI parsing and wiring.

pub mod agent;
pub mod command;
pub mod config;
pub mod consts;
pub mod dispatcher;
pub mod error;
pub mod file_transfer;
pub mod filter;
pub mod operator;
pub mod pipe;
pub mod reaper;
pub mod registry;
pub mod response;
pub mod server;
pub mod transport;
pub mod tunnel;
pub mod ufs;
pub mod uuidnorm;
pub mod vm_registry;

pub use error::FleetError;
