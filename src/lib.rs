// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Library root for the LwM2M bootstrap server.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! LwM2M bootstrap server.
//!
//! Clients that send a bootstrap request are matched to a configured profile and then
//! walked through its commands (delete, write security, write server, finish) one at a
//! time over CoAP/UDP from a single-threaded event loop.

pub mod config;
pub mod connection;
pub mod console;
pub mod engine;
pub mod registry;
pub mod sequencer;
pub mod server;
pub mod uri;

pub use config::{BootstrapConfig, Command, ConfigError, EndpointProfile, ServerDescriptor};
pub use connection::{ConnectionError, ConnectionTable, SessionId};
pub use engine::{
    CoapEngine, ContentFormat, EngineError, EngineEvent, Outbound, ProtocolEngine, Verdict,
};
pub use registry::{CommandStatus, Endpoint, EndpointRegistry, RegistryError};
pub use sequencer::CommandSequencer;
pub use server::{BootstrapServer, ServerConfig, ServerError, ShutdownHandle};
pub use uri::{Lwm2mUri, UriError};
