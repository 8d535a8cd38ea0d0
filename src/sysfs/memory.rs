//! An in-memory sysfs-like tree.
//!
//! Behaves like sysfs where it matters to the protocol client: files named
//! `mgmt` keep their help text when written to, symlinks resolve relative to
//! their parent, and every successful write is journaled in order.
use std::{
    collections::BTreeMap,
    io,
    path::{Component, Path, PathBuf},
};

use parking_lot::Mutex;

use super::fs::{ControlFs, EntryKind};
use crate::util::names::MGMT;

/// Symlink hops before giving up, same as the kernel's `MAXSYMLINKS`.
const MAX_HOPS: usize = 40;

#[derive(Debug, Clone)]
enum Node {
    File { content: String, writable: bool },
    Dir,
    Symlink(PathBuf),
}

/// In-memory [`ControlFs`].
///
/// All paths are absolute.
#[derive(Debug)]
pub struct MemFs {
    nodes: Mutex<BTreeMap<PathBuf, Node>>,
    journal: Mutex<Vec<(PathBuf, String)>>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

// Public
impl MemFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(PathBuf::from("/"), Node::Dir);
        Self {
            nodes: Mutex::new(nodes),
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Create directory `path` and any missing parents.
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let mut nodes = self.nodes.lock();
        make_parents(&mut nodes, path.as_ref());
        nodes.insert(normalize(path.as_ref()), Node::Dir);
    }

    /// Create or replace file `path`, creating parents.
    pub fn add_file(&self, path: impl AsRef<Path>, content: &str, writable: bool) {
        let mut nodes = self.nodes.lock();
        make_parents(&mut nodes, path.as_ref());
        nodes.insert(
            normalize(path.as_ref()),
            Node::File {
                content: content.into(),
                writable,
            },
        );
    }

    /// Create symlink `path` pointing at `target`, creating parents.
    ///
    /// Relative targets resolve against the link's parent directory.
    pub fn add_symlink(&self, path: impl AsRef<Path>, target: impl Into<PathBuf>) {
        let mut nodes = self.nodes.lock();
        make_parents(&mut nodes, path.as_ref());
        nodes.insert(normalize(path.as_ref()), Node::Symlink(target.into()));
    }

    /// Replace a file's content without journaling, following symlinks.
    ///
    /// Returns `false` if `path` is not a file.
    pub fn set_content(&self, path: impl AsRef<Path>, content: &str) -> bool {
        let mut nodes = self.nodes.lock();
        let Some(real) = resolve(&nodes, path.as_ref(), true) else {
            return false;
        };
        match nodes.get_mut(&real) {
            Some(Node::File { content: c, .. }) => {
                *c = content.into();
                true
            }
            _ => false,
        }
    }

    /// Remove `path` and everything below it. Symlinks are removed, never
    /// their targets.
    pub fn remove(&self, path: impl AsRef<Path>) {
        let path = normalize(path.as_ref());
        self.nodes
            .lock()
            .retain(|k, _| k != &path && !k.starts_with(&path));
    }

    /// Every successful write so far, in order.
    pub fn writes(&self) -> Vec<(PathBuf, String)> {
        self.journal.lock().clone()
    }

    /// Drain the write journal.
    pub fn take_writes(&self) -> Vec<(PathBuf, String)> {
        std::mem::take(&mut *self.journal.lock())
    }
}

impl ControlFs for MemFs {
    fn kind(&self, path: &Path) -> Option<EntryKind> {
        let nodes = self.nodes.lock();
        let real = resolve(&nodes, path, false)?;
        nodes.get(&real).map(|n| match n {
            Node::File { .. } => EntryKind::File,
            Node::Dir => EntryKind::Dir,
            Node::Symlink(_) => EntryKind::Symlink,
        })
    }

    fn exists(&self, path: &Path) -> bool {
        let nodes = self.nodes.lock();
        resolve(&nodes, path, true).map_or(false, |p| nodes.contains_key(&p))
    }

    fn is_dir(&self, path: &Path) -> bool {
        let nodes = self.nodes.lock();
        resolve(&nodes, path, true).map_or(false, |p| matches!(nodes.get(&p), Some(Node::Dir)))
    }

    fn read(&self, path: &Path) -> io::Result<String> {
        let nodes = self.nodes.lock();
        match resolve(&nodes, path, true).and_then(|p| nodes.get(&p)) {
            Some(Node::File { content, .. }) => Ok(content.clone()),
            Some(_) => Err(io::Error::new(io::ErrorKind::Other, "is a directory")),
            None => Err(io::ErrorKind::NotFound.into()),
        }
    }

    fn write(&self, path: &Path, data: &str) -> io::Result<()> {
        let mut nodes = self.nodes.lock();
        let real = resolve(&nodes, path, true).ok_or(io::ErrorKind::NotFound)?;
        match nodes.get_mut(&real) {
            Some(Node::File { content, writable }) => {
                if !*writable {
                    return Err(io::ErrorKind::PermissionDenied.into());
                }
                if real.file_name().map_or(true, |n| n != MGMT) {
                    *content = data.into();
                }
            }
            Some(_) => return Err(io::Error::new(io::ErrorKind::Other, "is a directory")),
            None => return Err(io::ErrorKind::NotFound.into()),
        }
        drop(nodes);
        self.journal.lock().push((path.to_path_buf(), data.into()));
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let nodes = self.nodes.lock();
        let real = resolve(&nodes, path, true).ok_or(io::ErrorKind::NotFound)?;
        if !matches!(nodes.get(&real), Some(Node::Dir)) {
            return Err(io::ErrorKind::NotFound.into());
        }
        Ok(nodes
            .range(real.clone()..)
            .skip(1)
            .take_while(|(k, _)| k.starts_with(&real))
            .filter(|(k, _)| k.parent() == Some(real.as_path()))
            .filter_map(|(k, _)| k.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect())
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        let nodes = self.nodes.lock();
        match resolve(&nodes, path, false).and_then(|p| nodes.get(&p)) {
            Some(Node::Symlink(target)) => Ok(target.clone()),
            Some(_) => Err(io::Error::new(io::ErrorKind::Other, "not a symlink")),
            None => Err(io::ErrorKind::NotFound.into()),
        }
    }

    fn writable(&self, path: &Path) -> bool {
        let nodes = self.nodes.lock();
        matches!(
            resolve(&nodes, path, true).and_then(|p| nodes.get(&p)),
            Some(Node::File { writable: true, .. })
        )
    }
}

// Private

/// Lexically clean `path`, making it absolute.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for c in path.components() {
        match c {
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(n) => out.push(n),
            _ => {}
        }
    }
    out
}

fn make_parents(nodes: &mut BTreeMap<PathBuf, Node>, path: &Path) {
    let path = normalize(path);
    for p in path.ancestors().skip(1) {
        nodes.entry(p.to_path_buf()).or_insert(Node::Dir);
    }
}

/// Resolve symlinks in `path`. The last component is only followed if
/// `follow_last` is set.
fn resolve(nodes: &BTreeMap<PathBuf, Node>, path: &Path, follow_last: bool) -> Option<PathBuf> {
    let comps: Vec<_> = path.components().collect();
    let mut cur = PathBuf::from("/");
    let mut hops = 0;
    for (i, c) in comps.iter().enumerate() {
        match c {
            Component::Normal(n) => cur.push(n),
            Component::ParentDir => {
                cur.pop();
                continue;
            }
            _ => continue,
        }
        if i + 1 == comps.len() && !follow_last {
            break;
        }
        while let Some(Node::Symlink(target)) = nodes.get(&cur) {
            hops += 1;
            if hops > MAX_HOPS {
                return None;
            }
            let base = cur.parent().unwrap_or(Path::new("/"));
            cur = normalize(&base.join(target));
        }
    }
    Some(cur)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> MemFs {
        let fs = MemFs::new();
        fs.add_file("/scst/devices/d1/filename", "/tmp/x\n[key]\n", true);
        fs.add_symlink("/scst/devices/d1/handler", "../../handlers/vdisk_fileio");
        fs.add_file("/scst/handlers/vdisk_fileio/mgmt", "help text", true);
        fs.add_symlink("/scst/handlers/vdisk_fileio/d1", "../../devices/d1");
        fs
    }

    #[test]
    fn links_resolve_relative_to_parent() {
        let fs = tree();
        let via_link = Path::new("/scst/handlers/vdisk_fileio/d1/filename");
        assert_eq!(fs.read(via_link).unwrap(), "/tmp/x\n[key]\n");
        assert_eq!(fs.kind(Path::new("/scst/handlers/vdisk_fileio/d1")), Some(EntryKind::Symlink));
        assert!(fs.is_dir(Path::new("/scst/handlers/vdisk_fileio/d1")));
        assert_eq!(
            fs.read_link(Path::new("/scst/devices/d1/handler")).unwrap(),
            PathBuf::from("../../handlers/vdisk_fileio")
        );
    }

    #[test]
    fn listing_is_direct_children_only() {
        let fs = tree();
        let mut names = fs.read_dir(Path::new("/scst/devices/d1")).unwrap();
        names.sort();
        assert_eq!(names, ["filename", "handler"]);
        let mut names = fs.read_dir(Path::new("/scst/handlers/vdisk_fileio/d1")).unwrap();
        names.sort();
        assert_eq!(names, ["filename", "handler"]);
    }

    #[test]
    fn mgmt_keeps_help_and_journals() {
        let fs = tree();
        let mgmt = Path::new("/scst/handlers/vdisk_fileio/mgmt");
        fs.write(mgmt, "add_device d2").unwrap();
        assert_eq!(fs.read(mgmt).unwrap(), "help text");
        assert_eq!(fs.writes(), [(mgmt.to_path_buf(), "add_device d2".to_owned())]);
    }

    #[test]
    fn remove_keeps_link_targets() {
        let fs = tree();
        fs.remove("/scst/handlers/vdisk_fileio/d1");
        assert!(fs.exists(Path::new("/scst/devices/d1/filename")));
        assert!(!fs.exists(Path::new("/scst/handlers/vdisk_fileio/d1")));
    }
}
