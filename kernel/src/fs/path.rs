//! Pathnames and their resolution.
//!
//! `namex` walks one element at a time. The current inode is locked only
//! while it is examined, and unlocked before descending, so lookups
//! never hold two inode locks at once (which could deadlock on `.`/`..`
//! cycles). Traversal of every intermediate directory requires search
//! (execute) permission. `..` at the process's root does not ascend, so
//! a `chroot`ed process cannot climb out.

use core::cmp;

use cstr_core::CStr;

use crate::error::{KernelError, Result};
use crate::param::ROOTDEV;
use crate::proc::KernelCtx;

use super::inode::{RcInode, DIRSIZ, ROOTINO};
use super::stat::s_isdir;
use super::{FsOps as _, Tx};

/// One path element: no NUL, no `/`, at most `DIRSIZ` bytes.
#[derive(PartialEq)]
#[repr(transparent)]
pub struct FileName {
    inner: [u8],
}

impl FileName {
    /// Truncates everything past the first `DIRSIZ` bytes.
    ///
    /// # Safety
    ///
    /// `bytes` must not contain NUL.
    pub unsafe fn from_bytes(bytes: &[u8]) -> &Self {
        debug_assert!(!bytes.contains(&0));
        // SAFETY: repr(transparent) over [u8]; length capped at DIRSIZ.
        unsafe { &*(&bytes[..cmp::min(DIRSIZ, bytes.len())] as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }
}

/// A slash-separated path. Contains no NUL.
#[repr(transparent)]
pub struct Path {
    inner: [u8],
}

impl Path {
    pub fn new(cstr: &CStr) -> &Self {
        // SAFETY: repr(transparent) over [u8]; a CStr body has no NUL.
        unsafe { &*(cstr.to_bytes() as *const [u8] as *const Self) }
    }

    /// # Safety
    ///
    /// `bytes` must not contain NUL.
    pub unsafe fn from_bytes(bytes: &[u8]) -> &Self {
        // SAFETY: repr(transparent) over [u8].
        unsafe { &*(bytes as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    pub fn is_absolute(&self) -> bool {
        !self.inner.is_empty() && self.inner[0] == b'/'
    }

    pub fn is_empty_string(&self) -> bool {
        self.inner.is_empty()
    }

    /// Splits off the next path element.
    ///
    /// Returns `Some((rest, name))`, where `rest` has no leading
    /// slashes, so `rest.is_empty_string()` tells whether `name` was the
    /// final element. Returns `None` when nothing remains.
    ///
    /// ```text
    /// "a/bb/c"  -> ("bb/c", "a")
    /// "///a//bb" -> ("bb", "a")
    /// "a"       -> ("", "a")
    /// ""  "////" -> None
    /// ```
    pub fn skipelem(&self) -> Option<(&Self, &FileName)> {
        let mut bytes = &self.inner;

        let start = bytes.iter().position(|&c| c != b'/')?;
        bytes = &bytes[start..];

        let len = bytes.iter().position(|&c| c == b'/').unwrap_or(bytes.len());
        // SAFETY: a subslice of a Path has no NUL.
        let name = unsafe { FileName::from_bytes(&bytes[..len]) };
        bytes = &bytes[len..];

        let next = bytes.iter().position(|&c| c != b'/').unwrap_or(bytes.len());
        // SAFETY: a subslice of a Path has no NUL.
        let rest = unsafe { Self::from_bytes(&bytes[next..]) };
        Some((rest, name))
    }

    /// The final component, for process naming.
    pub fn file_name(&self) -> &[u8] {
        match self.inner.iter().rposition(|&c| c == b'/') {
            Some(i) => &self.inner[i + 1..],
            None => &self.inner,
        }
    }
}

/// The starting inode of a walk, plus the identity of the process root
/// for the root-hop check.
fn walk_start(path: &Path, ctx: &KernelCtx<'_>) -> (RcInode, (u32, u32)) {
    if ctx.data().fs.is_some() {
        let guard = ctx.fs_info().lock();
        let root = guard.root.as_ref().expect("fs_info root");
        let root_id = (root.dev, root.inum);
        let ip = if path.is_absolute() {
            root.clone()
        } else {
            guard.cwd.as_ref().expect("fs_info cwd").clone()
        };
        drop(guard);
        (ip, root_id)
    } else {
        // Before processes have filesystem state, walks start at the
        // image root.
        let fs = ctx
            .kernel()
            .fstab()
            .find(ROOTDEV)
            .expect("root fs unregistered");
        (
            fs.ops.get_inode(ROOTDEV, ROOTINO, ctx),
            (ROOTDEV, ROOTINO),
        )
    }
}

fn namex<'p>(
    path: &'p Path,
    wantparent: bool,
    tx: &Tx<'_>,
    ctx: &KernelCtx<'_>,
) -> Result<(RcInode, Option<&'p FileName>)> {
    let (mut ip, root_id) = walk_start(path, ctx);
    let mut rest = path;

    while let Some((next_rest, name)) = rest.skipelem() {
        rest = next_rest;

        let mut guard = ip.lock(ctx);
        if !s_isdir(guard.mode) {
            drop(guard);
            ip.free((tx, ctx));
            return Err(KernelError::ENOTDIR);
        }
        if guard.permissions(ctx) & 1 == 0 {
            // No search permission on an intermediate directory.
            drop(guard);
            ip.free((tx, ctx));
            return Err(KernelError::EPERM);
        }
        if wantparent && rest.is_empty_string() {
            // Stop one level early; the caller gets the parent.
            drop(guard);
            return Ok((ip, Some(name)));
        }

        // `..` at the process root stays put.
        if name.as_bytes() == b".." && (ip.dev, ip.inum) == root_id {
            drop(guard);
            continue;
        }

        let next = guard.dirlookup(name, ctx);
        drop(guard);
        match next {
            Ok((next, _)) => {
                ip.free((tx, ctx));
                ip = next;
            }
            Err(e) => {
                ip.free((tx, ctx));
                return Err(e);
            }
        }
    }

    if wantparent {
        ip.free((tx, ctx));
        return Err(KernelError::ENOENT);
    }
    Ok((ip, None))
}

/// Resolves `path` to an inode reference.
pub fn namei(path: &Path, tx: &Tx<'_>, ctx: &KernelCtx<'_>) -> Result<RcInode> {
    Ok(namex(path, false, tx, ctx)?.0)
}

/// Resolves `path` to its parent directory and the final element.
pub fn nameiparent<'p>(
    path: &'p Path,
    tx: &Tx<'_>,
    ctx: &KernelCtx<'_>,
) -> Result<(RcInode, &'p FileName)> {
    let (ip, name) = namex(path, true, tx, ctx)?;
    match name {
        Some(name) => Ok((ip, name)),
        None => {
            ip.free((tx, ctx));
            Err(KernelError::ENOENT)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(bytes: &[u8]) -> &Path {
        // SAFETY: test inputs contain no NUL.
        unsafe { Path::from_bytes(bytes) }
    }

    #[test]
    fn skipelem_splits_components() {
        let (rest, name) = path(b"a/bb/c").skipelem().unwrap();
        assert_eq!(name.as_bytes(), b"a");
        assert_eq!(rest.as_bytes(), b"bb/c");

        let (rest, name) = path(b"///a//bb").skipelem().unwrap();
        assert_eq!(name.as_bytes(), b"a");
        assert_eq!(rest.as_bytes(), b"bb");

        let (rest, name) = path(b"a").skipelem().unwrap();
        assert_eq!(name.as_bytes(), b"a");
        assert!(rest.is_empty_string());

        assert!(path(b"").skipelem().is_none());
        assert!(path(b"////").skipelem().is_none());
    }

    #[test]
    fn long_names_truncate_to_dirsiz() {
        let (_, name) = path(b"abcdefghijklmnopqrs").skipelem().unwrap();
        assert_eq!(name.as_bytes().len(), DIRSIZ);
        assert_eq!(name.as_bytes(), b"abcdefghijklmn");
    }

    #[test]
    fn absolute_detection() {
        assert!(path(b"/etc/passwd").is_absolute());
        assert!(!path(b"etc/passwd").is_absolute());
        assert!(!path(b"").is_absolute());
    }

    #[test]
    fn file_name_is_last_component() {
        assert_eq!(path(b"/bin/sh").file_name(), b"sh");
        assert_eq!(path(b"sh").file_name(), b"sh");
        assert_eq!(path(b"/bin/").file_name(), b"");
    }
}
