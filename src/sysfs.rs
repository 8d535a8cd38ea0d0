//! Protocol client for the SCST sysfs control plane.
//!
//! SCST is configured entirely through files under `/sys/kernel/scst_tgt`:
//! one directory per object, one file per attribute, and `mgmt` files which
//! accept command strings such as `add_device disk1 filename=/x;`.
//!
//! # Implementation Details
//!
//! Attribute files which differ from their compiled-in default carry a
//! `[key]` marker on their own trailing line:
//!
//! ```text
//! /dev/sdb
//! [key]
//! ```
//!
//! Commands may complete asynchronously. In that case the write fails with
//! `EAGAIN` and the outcome appears later in `last_sysfs_mgmt_res`, which
//! holds `0` on success and a negative errno otherwise.
//!
//! # Stability
//!
//! None of this is a documented kernel ABI, and it changes between SCST
//! releases. The `mgmt` help text in particular is parsed by a few fixed
//! label lines only, see [`mgmt`].
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use nix::errno::Errno;
use tracing::debug;

pub use self::{
    fs::{ControlFs, EntryKind, HostFs},
    memory::MemFs,
    mgmt::MgmtInfo,
};
use crate::{
    error::SysfsError,
    util::{names::*, KEY_MARKER, SCST_ROOT},
};

mod fs;
mod memory;
pub mod mgmt;

pub type Result<T, E = SysfsError> = std::result::Result<T, E>;

/// Default for how long to wait on an asynchronous command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default delay between result register polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Client for one SCST control-plane tree.
#[derive(Debug, Clone)]
pub struct Sysfs {
    fs: Arc<dyn ControlFs>,
    root: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
}

// Public
impl Sysfs {
    /// Control plane rooted at `root`, accessed through `fs`.
    pub fn new(fs: Arc<dyn ControlFs>, root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            root: root.into(),
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// The live control plane at [`SCST_ROOT`].
    pub fn host() -> Self {
        Self::new(Arc::new(HostFs), SCST_ROOT)
    }

    /// Set how long asynchronous commands may take, and how often to check.
    pub fn with_timeout(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn handlers(&self) -> PathBuf {
        self.root.join(HANDLERS)
    }

    pub fn devices(&self) -> PathBuf {
        self.root.join(DEVICES)
    }

    pub fn targets(&self) -> PathBuf {
        self.root.join(TARGETS)
    }

    pub fn device_groups(&self) -> PathBuf {
        self.root.join(DEVICE_GROUPS)
    }

    pub fn handler(&self, handler: &str) -> PathBuf {
        self.handlers().join(handler)
    }

    pub fn device(&self, device: &str) -> PathBuf {
        self.devices().join(device)
    }

    pub fn driver(&self, driver: &str) -> PathBuf {
        self.targets().join(driver)
    }

    pub fn target(&self, driver: &str, target: &str) -> PathBuf {
        self.driver(driver).join(target)
    }

    pub fn device_group(&self, group: &str) -> PathBuf {
        self.device_groups().join(group)
    }

    /// Whether the control plane exists at all.
    pub fn available(&self) -> bool {
        self.fs.is_dir(&self.root)
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.fs.exists(path)
    }

    pub fn is_dir(&self, path: &Path) -> bool {
        self.fs.is_dir(path)
    }

    /// Entry kind of `path` itself, without following symlinks.
    pub fn kind(&self, path: &Path) -> Option<EntryKind> {
        self.fs.kind(path)
    }

    pub fn writable(&self, path: &Path) -> bool {
        self.fs.writable(path)
    }

    /// Last path component of the symlink target at `path`.
    ///
    /// SCST links devices to handlers and LUNs to devices, and the name is
    /// all that matters.
    pub fn link_name(&self, path: &Path) -> Option<String> {
        let target = self.fs.read_link(path).ok()?;
        target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }

    /// Read `path`, trimmed.
    ///
    /// # Errors
    ///
    /// - If `path` does not exist
    /// - If `path` couldn't be read
    pub fn read(&self, path: &Path) -> Result<String> {
        self.read_raw(path).map(|s| s.trim().to_owned())
    }

    /// Read the first line of `path`.
    ///
    /// This is the value of an attribute, without any `[key]` marker.
    ///
    /// # Errors
    ///
    /// - See [`Sysfs::read`]
    pub fn read_attribute(&self, path: &Path) -> Result<String> {
        let raw = self.read_raw(path)?;
        Ok(raw.lines().next().unwrap_or_default().trim_end().to_owned())
    }

    /// Read `path`, but only if it is marked as non-default.
    ///
    /// # Errors
    ///
    /// - See [`Sysfs::read`]
    pub fn read_if_non_default(&self, path: &Path) -> Result<Option<String>> {
        let raw = self.read(path)?;
        Ok(raw
            .strip_suffix(KEY_MARKER)
            .map(|v| v.trim().to_owned()))
    }

    /// Entries of directory `path`, sorted, without dot-files.
    ///
    /// Returns nothing if `path` does not exist or can't be listed.
    pub fn list(&self, path: &Path) -> Vec<String> {
        let mut names: Vec<String> = match self.fs.read_dir(path) {
            Ok(names) => names.into_iter().filter(|n| !n.starts_with('.')).collect(),
            Err(_) => return Vec::new(),
        };
        names.sort();
        names
    }

    /// Write `value` to `path`.
    ///
    /// If `verify` is set the result register is checked afterwards, and
    /// commands that report `EAGAIN` are waited on until they complete.
    ///
    /// # Errors
    ///
    /// - If `path` does not exist or isn't writable
    /// - If the write fails
    /// - If `verify` is set and the command was rejected or timed out
    pub fn write(&self, path: &Path, value: &str, verify: bool) -> Result<()> {
        if !self.fs.exists(path) {
            return Err(SysfsError::Missing(path.into()));
        }
        if !self.fs.writable(path) {
            return Err(SysfsError::PermissionDenied(path.into()));
        }
        debug!(path = %path.display(), value = ?value, "write");
        match self.fs.write(path, value) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(Errno::EAGAIN as i32) => {
                if verify {
                    debug!(path = %path.display(), "command pending");
                    return self.wait_for_completion(path);
                }
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(SysfsError::PermissionDenied(path.into()));
            }
            Err(e) => return Err(SysfsError::io(path, e)),
        }
        if verify {
            self.check_result(path)?;
        }
        Ok(())
    }

    /// Send `"{verb} {argument}"` to the management file `path`.
    ///
    /// The result is verified. Callers which don't care about failure use
    /// [`crate::error::BestEffort`].
    ///
    /// # Errors
    ///
    /// - See [`Sysfs::write`]
    pub fn mgmt(&self, path: &Path, verb: &str, argument: &str) -> Result<()> {
        let cmd = if argument.is_empty() {
            verb.to_owned()
        } else {
            format!("{verb} {argument}")
        };
        self.write(path, &cmd, true)
    }

    /// Check the result register after a write to `path`.
    ///
    /// A missing register counts as success, older SCST versions lack it.
    ///
    /// # Errors
    ///
    /// - If the register holds anything but `0`
    pub fn check_result(&self, path: &Path) -> Result<()> {
        let reg = self.root.join(RESULT);
        if !self.fs.exists(&reg) {
            return Ok(());
        }
        let result = self.read(&reg)?;
        if result == "0" {
            Ok(())
        } else {
            Err(SysfsError::Rejected {
                path: path.into(),
                result,
            })
        }
    }
}

// Private
impl Sysfs {
    fn read_raw(&self, path: &Path) -> Result<String> {
        if !self.fs.exists(path) {
            return Err(SysfsError::Missing(path.into()));
        }
        self.fs.read(path).map_err(|e| SysfsError::io(path, e))
    }

    /// Poll the result register until it reports success, or time out.
    fn wait_for_completion(&self, path: &Path) -> Result<()> {
        let start = Instant::now();
        while start.elapsed() < self.timeout {
            if self.check_result(path).is_ok() {
                return Ok(());
            }
            thread::sleep(self.poll_interval);
        }
        Err(SysfsError::Timeout {
            path: path.into(),
            after: self.timeout,
        })
    }
}
