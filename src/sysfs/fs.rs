//! Filesystem access underneath the protocol client.
//!
//! Everything the client does to the control plane goes through
//! [`ControlFs`], so the same reconciliation code runs against the live
//! `/sys` tree ([`HostFs`]) or an in-memory one ([`super::MemFs`]).
use std::{
    fmt::Debug,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use rustix::fs::{access, Access};

/// What a directory entry is, *without* following symlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// Primitive operations on a sysfs-like tree.
///
/// Reads, writes and directory listings follow symlinks, as they would on a
/// real filesystem. [`ControlFs::kind`] and [`ControlFs::read_link`] do not.
pub trait ControlFs: Debug + Send + Sync {
    /// Entry kind of `path` itself, `lstat(2)` style.
    fn kind(&self, path: &Path) -> Option<EntryKind>;

    /// Whether `path` exists, following symlinks.
    fn exists(&self, path: &Path) -> bool;

    /// Whether `path` is a directory, following symlinks.
    fn is_dir(&self, path: &Path) -> bool;

    fn read(&self, path: &Path) -> io::Result<String>;

    /// Write `data` in a single call.
    ///
    /// Sysfs attributes expect the whole value in one `write(2)`, and
    /// report kernel-side failures through its return value.
    fn write(&self, path: &Path, data: &str) -> io::Result<()>;

    /// Names of the entries in `path`, unsorted.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    /// Whether the current process may write `path`.
    fn writable(&self, path: &Path) -> bool;
}

/// The real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFs;

impl ControlFs for HostFs {
    fn kind(&self, path: &Path) -> Option<EntryKind> {
        let ty = fs::symlink_metadata(path).ok()?.file_type();
        Some(if ty.is_symlink() {
            EntryKind::Symlink
        } else if ty.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        })
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn read(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn write(&self, path: &Path, data: &str) -> io::Result<()> {
        let mut f = OpenOptions::new().write(true).open(path)?;
        f.write_all(data.as_bytes())?;
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(path)
    }

    fn writable(&self, path: &Path) -> bool {
        access(path, Access::WRITE_OK).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn host_kinds_do_not_follow_links() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("attr");
        fs::write(&file, "1\n[key]\n").unwrap();
        let link = dir.path().join("link");
        symlink(dir.path(), &link).unwrap();

        let host = HostFs;
        assert_eq!(host.kind(&file), Some(EntryKind::File));
        assert_eq!(host.kind(dir.path()), Some(EntryKind::Dir));
        assert_eq!(host.kind(&link), Some(EntryKind::Symlink));
        assert!(host.is_dir(&link));
        assert_eq!(host.kind(&dir.path().join("missing")), None);
    }

    #[test]
    fn host_write_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("attr");
        fs::write(&file, "").unwrap();

        let host = HostFs;
        assert!(host.writable(&file));
        host.write(&file, "42").unwrap();
        assert_eq!(host.read(&file).unwrap(), "42");
        assert_eq!(host.read_dir(dir.path()).unwrap(), ["attr"]);
    }
}
