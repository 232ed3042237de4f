//! The canonical change event model.
//!
//! Every backend collapses its native notification vocabulary into the small
//! closed set of [`ChangeKind`]s defined here, so embedders never see
//! platform-specific detail.

use std::path::PathBuf;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// What happened to a watched file system entry.
///
/// The set is closed on purpose: backends map everything they cannot express
/// onto [`ChangeKind::Unknown`] rather than growing new variants, so that
/// the kind round-trips across process boundaries via [`ChangeKind::code`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
#[repr(u8)]
pub enum ChangeKind {
    /// An entry came into existence, including moves into a watched root.
    Created = 0,

    /// An entry ceased to exist, including moves out of a watched root.
    Removed = 1,

    /// The content or metadata of an entry changed.
    Modified = 2,

    /// The kernel dropped notifications, or the OS reported a coarse
    /// "something changed" condition. Consumers must treat this as an
    /// instruction to invalidate any cache of the affected subtree and
    /// re-enumerate it.
    Overflowed = 3,

    /// A raw event that carries no usable classification.
    Unknown = 4,
}

impl ChangeKind {
    /// Stable wire encoding of this kind.
    ///
    /// The codes are part of the public contract and never change between
    /// releases; embedders may persist or marshal them.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Inverse of [`ChangeKind::code`]. Returns `None` for codes this
    /// version does not know about.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ChangeKind::Created),
            1 => Some(ChangeKind::Removed),
            2 => Some(ChangeKind::Modified),
            3 => Some(ChangeKind::Overflowed),
            4 => Some(ChangeKind::Unknown),
            _ => None,
        }
    }
}

/// A single observed change beneath a watch root.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChangeEvent {
    /// Classification of the change.
    pub kind: ChangeKind,

    /// Absolute path of the affected entry.
    ///
    /// When only coarse-grained information is available (macOS delivers
    /// directory-level notifications, and overflows always concern a whole
    /// root) this is the path of the enclosing directory instead.
    pub path: PathBuf,
}

impl ChangeEvent {
    /// Creates an event for `path`.
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        ChangeEvent {
            kind,
            path: path.into(),
        }
    }
}
