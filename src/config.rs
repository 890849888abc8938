// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Load and validate bootstrap profiles and server descriptors.
// Author: Lukas Bower

//! Bootstrap profile file loader.
//!
//! The profile file is a TOML document with two arrays of tables:
//!
//! ```toml
//! [[server]]
//! id = 1
//! security = "c80001..."   # hex, written verbatim to /0/1
//! server = "c80001..."     # hex, written verbatim to /1/1
//!
//! [[endpoint]]
//! name = "dev1"            # omit for the wildcard profile
//! commands = [
//!     { op = "delete", uri = "/0" },
//!     { op = "write_security", server = 1 },
//!     { op = "write_server", server = 1 },
//!     { op = "finish" },
//! ]
//! ```
//!
//! The loaded [`BootstrapConfig`] is immutable and shared by every endpoint session.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::warn;
use serde::Deserialize;
use thiserror::Error;

use crate::uri::{Lwm2mUri, UriError};

/// Errors produced while loading the bootstrap profile file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The profile file could not be read.
    #[error("failed to read profile file {path}: {source}")]
    Io {
        /// Path that was opened.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// The file is not valid TOML or does not match the profile schema.
    #[error("malformed profile document: {0}")]
    Parse(#[from] toml::de::Error),
    /// A server payload is not valid hex.
    #[error("server {server}: invalid {field} payload: {source}")]
    InvalidPayload {
        /// Server id owning the payload.
        server: u16,
        /// Payload field name.
        field: &'static str,
        /// Decoder failure.
        source: hex::FromHexError,
    },
    /// A delete command carries a malformed URI.
    #[error("profile {profile}: {source}")]
    InvalidUri {
        /// Display name of the profile.
        profile: String,
        /// URI parse failure.
        source: UriError,
    },
    /// Two server descriptors share an id.
    #[error("server id {0} declared more than once")]
    DuplicateServer(u16),
    /// Two profiles share an endpoint name.
    #[error("endpoint profile '{0}' declared more than once")]
    DuplicateProfile(String),
    /// More than one profile omits its name.
    #[error("only one wildcard endpoint profile may be declared")]
    MultipleWildcards,
}

/// One bootstrap operation applied to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Delete the addressed object, instance or the whole data model.
    Delete(Lwm2mUri),
    /// Write the security payload of a server to `/0/<server>`.
    WriteSecurity(u16),
    /// Write the server payload of a server to `/1/<server>`.
    WriteServer(u16),
    /// Signal the end of the bootstrap sequence.
    Finish,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delete(uri) => write!(f, "delete {uri}"),
            Self::WriteSecurity(id) => write!(f, "write security {}", Lwm2mUri::security(*id)),
            Self::WriteServer(id) => write!(f, "write server {}", Lwm2mUri::server(*id)),
            Self::Finish => f.write_str("finish"),
        }
    }
}

/// Opaque payloads describing one LwM2M server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerDescriptor {
    security: Vec<u8>,
    server: Vec<u8>,
}

impl ServerDescriptor {
    /// Construct a descriptor from raw payloads; empty payloads count as absent.
    #[must_use]
    pub fn new(security: Vec<u8>, server: Vec<u8>) -> Self {
        Self { security, server }
    }

    /// Security object payload, if one was configured.
    #[must_use]
    pub fn security_payload(&self) -> Option<&[u8]> {
        (!self.security.is_empty()).then_some(self.security.as_slice())
    }

    /// Server object payload, if one was configured.
    #[must_use]
    pub fn server_payload(&self) -> Option<&[u8]> {
        (!self.server.is_empty()).then_some(self.server.as_slice())
    }
}

/// Ordered command list for one endpoint name, or the wildcard default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointProfile {
    name: Option<String>,
    commands: Vec<Command>,
}

impl EndpointProfile {
    /// Profile matching exactly `name`.
    #[must_use]
    pub fn named(name: impl Into<String>, commands: Vec<Command>) -> Self {
        Self {
            name: Some(name.into()),
            commands,
        }
    }

    /// Wildcard profile used when no name matches.
    #[must_use]
    pub fn wildcard(commands: Vec<Command>) -> Self {
        Self {
            name: None,
            commands,
        }
    }

    /// Endpoint name, `None` for the wildcard.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether this is the wildcard profile.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.name.is_none()
    }

    /// Commands in dispatch order.
    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| "*".to_owned())
    }
}

/// Immutable bootstrap configuration shared by all sessions.
#[derive(Debug, Clone, Default)]
pub struct BootstrapConfig {
    profiles: Vec<Arc<EndpointProfile>>,
    servers: BTreeMap<u16, ServerDescriptor>,
}

impl BootstrapConfig {
    /// Build a configuration from already-typed parts, enforcing profile uniqueness.
    pub fn new(
        profiles: Vec<EndpointProfile>,
        servers: BTreeMap<u16, ServerDescriptor>,
    ) -> Result<Self, ConfigError> {
        let mut seen_wildcard = false;
        for (index, profile) in profiles.iter().enumerate() {
            match profile.name() {
                None if seen_wildcard => return Err(ConfigError::MultipleWildcards),
                None => seen_wildcard = true,
                Some(name) => {
                    if profiles[..index].iter().any(|p| p.name() == Some(name)) {
                        return Err(ConfigError::DuplicateProfile(name.to_owned()));
                    }
                }
            }
        }
        let config = Self {
            profiles: profiles.into_iter().map(Arc::new).collect(),
            servers,
        };
        config.warn_dangling_references();
        Ok(config)
    }

    /// Read and validate the profile file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate a profile document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;

        let mut servers = BTreeMap::new();
        for entry in raw.servers {
            let descriptor = ServerDescriptor::new(
                decode_payload(entry.id, "security", entry.security.as_deref())?,
                decode_payload(entry.id, "server", entry.server.as_deref())?,
            );
            if servers.insert(entry.id, descriptor).is_some() {
                return Err(ConfigError::DuplicateServer(entry.id));
            }
        }

        let mut profiles = Vec::with_capacity(raw.endpoints.len());
        for entry in raw.endpoints {
            let label = entry.name.clone().unwrap_or_else(|| "*".to_owned());
            let mut commands = Vec::with_capacity(entry.commands.len());
            for command in entry.commands {
                commands.push(match command {
                    RawCommand::Delete { uri } => {
                        let uri = uri.parse().map_err(|source| ConfigError::InvalidUri {
                            profile: label.clone(),
                            source,
                        })?;
                        Command::Delete(uri)
                    }
                    RawCommand::WriteSecurity { server } => Command::WriteSecurity(server),
                    RawCommand::WriteServer { server } => Command::WriteServer(server),
                    RawCommand::Finish {} => Command::Finish,
                });
            }
            profiles.push(EndpointProfile {
                name: entry.name,
                commands,
            });
        }

        Self::new(profiles, servers)
    }

    /// Profile for an endpoint: exact name match first, then the wildcard.
    #[must_use]
    pub fn profile_for(&self, endpoint_name: &str) -> Option<&Arc<EndpointProfile>> {
        self.profiles
            .iter()
            .find(|profile| profile.name() == Some(endpoint_name))
            .or_else(|| self.profiles.iter().find(|profile| profile.is_wildcard()))
    }

    /// Descriptor for a server id.
    #[must_use]
    pub fn server(&self, server_id: u16) -> Option<&ServerDescriptor> {
        self.servers.get(&server_id)
    }

    /// All profiles in declaration order.
    #[must_use]
    pub fn profiles(&self) -> &[Arc<EndpointProfile>] {
        &self.profiles
    }

    /// Number of configured server descriptors.
    #[must_use]
    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    fn warn_dangling_references(&self) {
        for profile in &self.profiles {
            for command in profile.commands() {
                let (server_id, present) = match command {
                    Command::WriteSecurity(id) => (
                        *id,
                        self.server(*id).and_then(ServerDescriptor::security_payload),
                    ),
                    Command::WriteServer(id) => (
                        *id,
                        self.server(*id).and_then(ServerDescriptor::server_payload),
                    ),
                    _ => continue,
                };
                if present.is_none() {
                    warn!(
                        "profile {}: '{command}' references server {server_id} without a payload",
                        profile.label()
                    );
                }
            }
        }
    }
}

fn decode_payload(
    server: u16,
    field: &'static str,
    text: Option<&str>,
) -> Result<Vec<u8>, ConfigError> {
    let Some(text) = text else {
        return Ok(Vec::new());
    };
    let compact: String = text.split_whitespace().collect();
    hex::decode(compact).map_err(|source| ConfigError::InvalidPayload {
        server,
        field,
        source,
    })
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default, rename = "server")]
    servers: Vec<RawServer>,
    #[serde(default, rename = "endpoint")]
    endpoints: Vec<RawEndpoint>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServer {
    id: u16,
    #[serde(default)]
    security: Option<String>,
    #[serde(default)]
    server: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEndpoint {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    commands: Vec<RawCommand>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
enum RawCommand {
    Delete { uri: String },
    WriteSecurity { server: u16 },
    WriteServer { server: u16 },
    // braces so unknown keys next to `op = "finish"` are rejected too
    Finish {},
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[server]]
        id = 1
        security = "c8 00 01"
        server = "c1 01 3c"

        [[endpoint]]
        name = "dev1"
        commands = [
            { op = "delete", uri = "/0" },
            { op = "write_security", server = 1 },
            { op = "write_server", server = 1 },
            { op = "finish" },
        ]

        [[endpoint]]
        commands = [{ op = "finish" }]
    "#;

    #[test]
    fn loads_profiles_and_servers() {
        let config = BootstrapConfig::from_toml_str(SAMPLE).expect("sample parses");
        assert_eq!(config.profiles().len(), 2);
        assert_eq!(config.server_count(), 1);
        let dev1 = config.profile_for("dev1").expect("dev1 profile");
        assert_eq!(
            dev1.commands(),
            &[
                Command::Delete(Lwm2mUri::object(0)),
                Command::WriteSecurity(1),
                Command::WriteServer(1),
                Command::Finish,
            ]
        );
        let server = config.server(1).expect("server 1");
        assert_eq!(server.security_payload(), Some(&[0xc8, 0x00, 0x01][..]));
        assert_eq!(server.server_payload(), Some(&[0xc1, 0x01, 0x3c][..]));
    }

    #[test]
    fn falls_back_to_wildcard_only_without_exact_match() {
        let config = BootstrapConfig::from_toml_str(SAMPLE).unwrap();
        assert!(!config.profile_for("dev1").unwrap().is_wildcard());
        assert!(config.profile_for("dev2").unwrap().is_wildcard());
        assert!(config.profile_for("DEV1").unwrap().is_wildcard());
    }

    #[test]
    fn no_profile_without_wildcard() {
        let config =
            BootstrapConfig::new(vec![EndpointProfile::named("a", vec![])], BTreeMap::new())
                .unwrap();
        assert!(config.profile_for("b").is_none());
    }

    #[test]
    fn rejects_second_wildcard() {
        let err = BootstrapConfig::from_toml_str(
            "[[endpoint]]\ncommands = []\n[[endpoint]]\ncommands = []\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MultipleWildcards));
    }

    #[test]
    fn rejects_duplicates_and_bad_values() {
        let dup_server = "[[server]]\nid = 2\n[[server]]\nid = 2\n";
        assert!(matches!(
            BootstrapConfig::from_toml_str(dup_server),
            Err(ConfigError::DuplicateServer(2))
        ));
        let dup_name = "[[endpoint]]\nname = \"x\"\n[[endpoint]]\nname = \"x\"\n";
        assert!(matches!(
            BootstrapConfig::from_toml_str(dup_name),
            Err(ConfigError::DuplicateProfile(name)) if name == "x"
        ));
        let bad_hex = "[[server]]\nid = 3\nsecurity = \"zz\"\n";
        assert!(matches!(
            BootstrapConfig::from_toml_str(bad_hex),
            Err(ConfigError::InvalidPayload { server: 3, field: "security", .. })
        ));
        let bad_uri = "[[endpoint]]\nname = \"y\"\ncommands = [{ op = \"delete\", uri = \"0\" }]\n";
        assert!(matches!(
            BootstrapConfig::from_toml_str(bad_uri),
            Err(ConfigError::InvalidUri { .. })
        ));
        assert!(matches!(
            BootstrapConfig::from_toml_str("[[endpoint]]\nname = 5\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn empty_payloads_count_as_absent() {
        let config = BootstrapConfig::from_toml_str("[[server]]\nid = 4\nsecurity = \"\"\n").unwrap();
        let server = config.server(4).unwrap();
        assert!(server.security_payload().is_none());
        assert!(server.server_payload().is_none());
    }
}
