// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: LwM2M object/instance/resource addressing used by bootstrap commands.
// Author: Lukas Bower

//! LwM2M URIs of the form `/object[/instance[/resource]]`.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Object id of the LwM2M Security object.
pub const SECURITY_OBJECT_ID: u16 = 0;
/// Object id of the LwM2M Server object.
pub const SERVER_OBJECT_ID: u16 = 1;

/// Errors raised while parsing a textual LwM2M URI.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    /// The URI did not start with `/`.
    #[error("uri '{0}' must start with '/'")]
    NotAbsolute(String),
    /// A path segment was empty or not a 16-bit identifier.
    #[error("uri '{uri}' has invalid segment '{segment}'")]
    InvalidSegment {
        /// Full URI as supplied.
        uri: String,
        /// Offending segment.
        segment: String,
    },
    /// More than three segments were supplied.
    #[error("uri '{0}' is deeper than object/instance/resource")]
    TooDeep(String),
}

/// Address of an LwM2M object, instance or resource. The empty URI (`/`) targets the
/// whole client data model and is only meaningful for bootstrap delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Lwm2mUri {
    object_id: Option<u16>,
    instance_id: Option<u16>,
    resource_id: Option<u16>,
}

impl Lwm2mUri {
    /// URI addressing every object on the client.
    #[must_use]
    pub const fn root() -> Self {
        Self {
            object_id: None,
            instance_id: None,
            resource_id: None,
        }
    }

    /// URI addressing a whole object.
    #[must_use]
    pub const fn object(object_id: u16) -> Self {
        Self {
            object_id: Some(object_id),
            instance_id: None,
            resource_id: None,
        }
    }

    /// URI addressing one object instance.
    #[must_use]
    pub const fn instance(object_id: u16, instance_id: u16) -> Self {
        Self {
            object_id: Some(object_id),
            instance_id: Some(instance_id),
            resource_id: None,
        }
    }

    /// Security object instance carrying the credentials for `server_id`.
    #[must_use]
    pub const fn security(server_id: u16) -> Self {
        Self::instance(SECURITY_OBJECT_ID, server_id)
    }

    /// Server object instance describing `server_id`.
    #[must_use]
    pub const fn server(server_id: u16) -> Self {
        Self::instance(SERVER_OBJECT_ID, server_id)
    }

    /// Object id, if set.
    #[must_use]
    pub fn object_id(&self) -> Option<u16> {
        self.object_id
    }

    /// Instance id, if set.
    #[must_use]
    pub fn instance_id(&self) -> Option<u16> {
        self.instance_id
    }

    /// Resource id, if set.
    #[must_use]
    pub fn resource_id(&self) -> Option<u16> {
        self.resource_id
    }

    /// Path segments in order, as carried by CoAP Uri-Path options.
    #[must_use]
    pub fn segments(&self) -> Vec<u16> {
        [self.object_id, self.instance_id, self.resource_id]
            .into_iter()
            .map_while(|id| id)
            .collect()
    }

    /// Rebuild a URI from numeric path segments. Returns `None` when there are more than
    /// three segments.
    #[must_use]
    pub fn from_segments(segments: &[u16]) -> Option<Self> {
        if segments.len() > 3 {
            return None;
        }
        Some(Self {
            object_id: segments.first().copied(),
            instance_id: segments.get(1).copied(),
            resource_id: segments.get(2).copied(),
        })
    }
}

impl FromStr for Lwm2mUri {
    type Err = UriError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let rest = trimmed
            .strip_prefix('/')
            .ok_or_else(|| UriError::NotAbsolute(trimmed.to_owned()))?;
        let rest = rest.strip_suffix('/').unwrap_or(rest);
        if rest.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::with_capacity(3);
        for segment in rest.split('/') {
            let id = segment
                .parse::<u16>()
                .map_err(|_| UriError::InvalidSegment {
                    uri: trimmed.to_owned(),
                    segment: segment.to_owned(),
                })?;
            segments.push(id);
        }
        Self::from_segments(&segments).ok_or_else(|| UriError::TooDeep(trimmed.to_owned()))
    }
}

impl fmt::Display for Lwm2mUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let segments = self.segments();
        if segments.is_empty() {
            return f.write_str("/");
        }
        for id in segments {
            write!(f, "/{id}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_root_and_nested_paths() {
        assert_eq!("/".parse::<Lwm2mUri>().unwrap(), Lwm2mUri::root());
        assert_eq!("/0".parse::<Lwm2mUri>().unwrap(), Lwm2mUri::object(0));
        assert_eq!("/1/3/".parse::<Lwm2mUri>().unwrap(), Lwm2mUri::server(3));
        let full: Lwm2mUri = "/3/0/13".parse().unwrap();
        assert_eq!(full.resource_id(), Some(13));
        assert_eq!(full.to_string(), "/3/0/13");
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(matches!(
            "0/1".parse::<Lwm2mUri>(),
            Err(UriError::NotAbsolute(_))
        ));
        assert!(matches!(
            "/0//1".parse::<Lwm2mUri>(),
            Err(UriError::InvalidSegment { .. })
        ));
        assert!(matches!(
            "/70000".parse::<Lwm2mUri>(),
            Err(UriError::InvalidSegment { .. })
        ));
        assert!(matches!(
            "/1/2/3/4".parse::<Lwm2mUri>(),
            Err(UriError::TooDeep(_))
        ));
    }

    #[test]
    fn security_and_server_instances_use_fixed_objects() {
        assert_eq!(Lwm2mUri::security(5).segments(), vec![0, 5]);
        assert_eq!(Lwm2mUri::server(5).segments(), vec![1, 5]);
        assert_eq!(Lwm2mUri::root().to_string(), "/");
    }
}
