//! Remote resource identifier parsing
//!
//! A remote resource is addressed as `protocol://host/path`. Identifiers
//! that don't match a supported protocol are local resources and simply not
//! ours to handle: parsing returns `None` rather than an error so callers
//! can opt out cheaply.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Supported remote transfer protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Scp,
    Rsync,
}

impl Protocol {
    /// The URL scheme this protocol is addressed with.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Scp => "scp",
            Protocol::Rsync => "rsync",
        }
    }

    /// The local command-line tool that performs the transfer.
    pub fn transfer_program(&self) -> &'static str {
        match self {
            Protocol::Scp => "scp",
            Protocol::Rsync => "rsync",
        }
    }

    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "scp" => Some(Protocol::Scp),
            "rsync" => Some(Protocol::Rsync),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed remote write destination. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub protocol: Protocol,
    /// Host part, possibly `user@host`.
    pub host: String,
    /// Remote path with leading and duplicate separators stripped; resolved
    /// by the remote tools relative to the login directory.
    pub path: String,
}

impl RemoteTarget {
    /// Parse a resource identifier. Returns `None` for anything that is not
    /// a well-formed remote identifier with a known protocol.
    pub fn parse(resource: &str) -> Option<Self> {
        let (scheme, rest) = resource.split_once("://")?;
        let protocol = Protocol::from_scheme(scheme)?;

        let (host, raw_path) = rest.split_once('/')?;
        if host.is_empty() {
            return None;
        }

        let path = normalize_path(raw_path);
        if path.is_empty() {
            return None;
        }

        Some(Self {
            protocol,
            host: host.to_string(),
            path,
        })
    }

    /// The `host:path` form the transfer tools expect.
    pub fn remote_spec(&self) -> String {
        format!("{}:{}", self.host, self.path)
    }

    /// Parent directory of the remote path, if the file is not at the top
    /// of the login directory.
    pub fn parent_dir(&self) -> Option<&str> {
        self.path.rsplit_once('/').map(|(parent, _)| parent)
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.protocol, self.host, self.path)
    }
}

/// Collapse duplicate separators and strip leading ones, so
/// `//proj//a.txt` and `proj/a.txt` address the same remote file.
fn normalize_path(raw: &str) -> String {
    raw.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
