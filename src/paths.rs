//! Path handling shared by the backends.

use std::env;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Resolves a caller-supplied root against the current directory.
///
/// Symlinks are deliberately not resolved; watch points are keyed on the
/// spelling the caller registered.
pub(crate) fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_owned())
    } else {
        let cwd = env::current_dir().map_err(Error::io)?;
        Ok(cwd.join(path))
    }
}

#[cfg(windows)]
pub(crate) mod wide {
    //! UTF-16 encoding for the Windows file APIs, including the long-path
    //! rewrite. Paths longer than the classic limit must be handed to
    //! `CreateFileW` as `\\?\C:\x` (local) or `\\?\UNC\srv\share\x`
    //! (share); reported event paths carry the unprefixed spelling, so the
    //! prefix is stripped from registration input before it becomes a
    //! watch-point key.

    use std::ffi::OsString;
    use std::os::windows::ffi::{OsStrExt, OsStringExt};
    use std::path::{Path, PathBuf};

    /// Paths of at most this many UTF-16 units are passed through untouched.
    const LONG_PATH_THRESHOLD: usize = 240;

    const SEP: u16 = b'\\' as u16;

    // `\\?\`
    const VERBATIM: [u16; 4] = [SEP, SEP, b'?' as u16, SEP];

    // `\\?\UNC\`
    const VERBATIM_UNC: [u16; 8] = [
        SEP,
        SEP,
        b'?' as u16,
        SEP,
        b'U' as u16,
        b'N' as u16,
        b'C' as u16,
        SEP,
    ];

    /// Encodes `path` for `CreateFileW`, rewriting to the long form when
    /// the path exceeds the classic limit. The returned buffer is
    /// NUL-terminated.
    pub(crate) fn to_watch_path(path: &Path) -> Vec<u16> {
        let units: Vec<u16> = path.as_os_str().encode_wide().collect();
        let mut encoded = if units.len() <= LONG_PATH_THRESHOLD || units.starts_with(&VERBATIM) {
            units
        } else if units.starts_with(&[SEP, SEP]) {
            let mut long = VERBATIM_UNC.to_vec();
            long.extend_from_slice(&units[2..]);
            long
        } else {
            let mut long = VERBATIM.to_vec();
            long.extend_from_slice(&units);
            long
        };
        encoded.push(0);
        encoded
    }

    /// Strips the long-path prefix, if present, so watch-point keys and
    /// reported paths match what callers registered.
    pub(crate) fn strip_long_prefix(path: &Path) -> PathBuf {
        let units: Vec<u16> = path.as_os_str().encode_wide().collect();
        if units.starts_with(&VERBATIM_UNC) {
            let mut stripped = vec![SEP, SEP];
            stripped.extend_from_slice(&units[VERBATIM_UNC.len()..]);
            PathBuf::from(OsString::from_wide(&stripped))
        } else if units.starts_with(&VERBATIM) {
            PathBuf::from(OsString::from_wide(&units[VERBATIM.len()..]))
        } else {
            path.to_owned()
        }
    }

}
