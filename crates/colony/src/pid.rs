//! Hierarchical process identifiers.
//!
//! A [`ProcessId`] addresses a process by its position in the supervision
//! tree rather than by an opaque number. The canonical string form joins the
//! path segments with `/`:
//!
//! ```text
//! /root/user/billing/invoice-7
//! ```
//!
//! Identifiers are cheap to clone (the segment list is shared behind an
//! `Arc`), compare segment-wise, and serialize to/from the canonical string
//! form so they can travel through a cluster backend unchanged.
//!
//! The distinguished [`ProcessId::none()`] value represents "no process" and
//! is used as the sender of anonymous messages.

use crate::error::ProcessError;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// The reserved first segment of every live process path.
pub const ROOT_SEGMENT: &str = "root";

/// The namespace segment for user-spawned processes.
pub const USER_SEGMENT: &str = "user";

/// The namespace segment reserved for runtime-internal processes.
pub const SYSTEM_SEGMENT: &str = "system";

/// A hierarchical process address.
///
/// Two `ProcessId`s are equal iff their path segments are equal in order.
///
/// # Examples
///
/// ```
/// use colony::ProcessId;
///
/// let pid = ProcessId::user().child("workers").unwrap().child("w1").unwrap();
/// assert_eq!(pid.to_string(), "/root/user/workers/w1");
/// assert_eq!(pid.name(), "w1");
/// assert_eq!(pid.parent().unwrap(), ProcessId::user().child("workers").unwrap());
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId {
    segments: Arc<Vec<String>>,
}

impl ProcessId {
    /// The distinguished "no process" identifier.
    ///
    /// Rendered as `/none`; never resolves to a live process.
    pub fn none() -> Self {
        Self {
            segments: Arc::new(Vec::new()),
        }
    }

    /// The root of the process tree, `/root`.
    pub fn root() -> Self {
        Self {
            segments: Arc::new(vec![ROOT_SEGMENT.to_string()]),
        }
    }

    /// The user namespace, `/root/user`. Top-level spawns land here.
    pub fn user() -> Self {
        Self {
            segments: Arc::new(vec![ROOT_SEGMENT.to_string(), USER_SEGMENT.to_string()]),
        }
    }

    /// The system namespace, `/root/system`, reserved for runtime processes.
    pub fn system() -> Self {
        Self {
            segments: Arc::new(vec![ROOT_SEGMENT.to_string(), SYSTEM_SEGMENT.to_string()]),
        }
    }

    /// Appends a child segment, validating the name.
    ///
    /// Fails with [`ProcessError::InvalidName`] if `name` is empty or
    /// contains the path separator.
    pub fn child(&self, name: &str) -> Result<Self, ProcessError> {
        validate_name(name)?;
        let mut segments = self.segments.as_ref().clone();
        segments.push(name.to_string());
        Ok(Self {
            segments: Arc::new(segments),
        })
    }

    /// The parent identifier, or `None` for the root and for
    /// [`ProcessId::none()`].
    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() <= 1 {
            return None;
        }
        let mut segments = self.segments.as_ref().clone();
        segments.pop();
        Some(Self {
            segments: Arc::new(segments),
        })
    }

    /// The leaf name, or `"none"` for the distinguished empty identifier.
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or("none")
    }

    /// Number of path segments.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Returns `true` for the distinguished "no process" value.
    pub fn is_none(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns `true` if `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &ProcessId) -> bool {
        other.segments.len() > self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// The path segments, root first.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

fn validate_name(name: &str) -> Result<(), ProcessError> {
    if name.is_empty() || name.contains('/') {
        return Err(ProcessError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(f, "/none");
        }
        for segment in self.segments.iter() {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl FromStr for ProcessId {
    type Err = ProcessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "/none" {
            return Ok(Self::none());
        }
        let trimmed = s.strip_prefix('/').ok_or_else(|| ProcessError::InvalidName {
            name: s.to_string(),
        })?;
        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            validate_name(segment).map_err(|_| ProcessError::InvalidName {
                name: s.to_string(),
            })?;
            segments.push(segment.to_string());
        }
        Ok(Self {
            segments: Arc::new(segments),
        })
    }
}

impl Serialize for ProcessId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProcessId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
