//! Kernel modules a configuration needs.
//!
//! Each handler and target driver lives in its own kernel module, and
//! `scst` itself is always needed. Modules are checked through
//! `/sys/module` and loaded with `modprobe`, the same way the SCST init
//! script does it.
//!
//! # Implementation
//!
//! A loaded module shows up as `/sys/module/<name>`, with `-` spelled `_`.
//! `crc32c` is special, any of its implementations counts.
use std::{
    fmt::Debug,
    io::{self, Read},
    path::{Path, PathBuf},
    process::{ChildStderr, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use nix::sys::utsname::uname;
use tracing::{debug, error, info};
use walkdir::WalkDir;

use crate::{
    config::Configuration,
    error::{text::*, ModuleError},
    util::{MODULE_PATH, SYSFS_PATH},
};

pub type Result<T, E = ModuleError> = std::result::Result<T, E>;

/// How long `modprobe` may take.
pub const MODPROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// How much of a failed `modprobe`'s stderr is kept for the error.
const STDERR_LIMIT: u64 = 4096;

const HANDLER_MODULES: &[(&str, &str)] = &[
    ("dev_cdrom", "scst_cdrom"),
    ("dev_changer", "scst_changer"),
    ("dev_disk", "scst_disk"),
    ("dev_disk_perf", "scst_disk"),
    ("dev_modisk", "scst_modisk"),
    ("dev_modisk_perf", "scst_modisk"),
    ("dev_processor", "scst_processor"),
    ("dev_raid", "scst_raid"),
    ("dev_tape", "scst_tape"),
    ("dev_tape_perf", "scst_tape"),
    ("dev_user", "scst_user"),
    ("vdisk_fileio", "scst_vdisk"),
    ("vdisk_blockio", "scst_vdisk"),
    ("vdisk_nullio", "scst_vdisk"),
    ("vcdrom", "scst_vdisk"),
];

/// `copy_manager` is built into `scst`.
const DRIVER_MODULES: &[(&str, &str)] = &[("iscsi", "iscsi_scst"), ("qla2x00t", "qla2x00tgt")];

/// Digest acceleration for iSCSI, nice to have.
const ISCSI_OPTIONAL: &[&str] = &["crc32c"];
const ISCSI_X86_OPTIONAL: &[&str] = &["crc32c-intel"];

/// Any of these provides `crc32c`.
const CRC32C_PROVIDERS: &[&str] = &["crc32c_intel", "crc32c_generic", "libcrc32c"];

/// Modules to ensure are loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleSet {
    /// Failing to load any of these is an error.
    pub required: Vec<String>,

    /// These are skipped if they can't be loaded.
    pub optional: Vec<String>,
}

impl ModuleSet {
    /// Modules needed by the handlers and drivers of `config`.
    ///
    /// `machine` is the hardware name, as from `uname -m`.
    pub fn for_config(config: &Configuration, machine: &str) -> Self {
        let mut set = Self::default();
        set.add_required("scst");
        for handler in config.handler_names() {
            if let Some((_, m)) = HANDLER_MODULES.iter().find(|(h, _)| *h == handler) {
                set.add_required(m);
            }
        }
        for driver in config.drivers.keys() {
            if let Some((_, m)) = DRIVER_MODULES.iter().find(|(d, _)| d == driver) {
                set.add_required(m);
            }
        }
        if config.drivers.contains_key("iscsi") {
            set.optional.extend(ISCSI_OPTIONAL.iter().map(|m| m.to_string()));
            if matches!(machine, "x86_64" | "i686") {
                set.optional
                    .extend(ISCSI_X86_OPTIONAL.iter().map(|m| m.to_string()));
            }
        }
        set
    }

    fn add_required(&mut self, module: &str) {
        if !self.required.iter().any(|m| m == module) {
            self.required.push(module.into());
        }
    }
}

/// Something that can check for and load kernel modules.
pub trait ModuleLoader: Debug + Send + Sync {
    /// Whether module `name` is loaded.
    fn is_loaded(&self, name: &str) -> bool;

    /// Whether a module file for `name` exists for the running kernel.
    fn is_installed(&self, name: &str) -> bool;

    /// Load module `name`.
    ///
    /// # Errors
    ///
    /// - If the module couldn't be loaded
    fn load(&self, name: &str) -> Result<()>;
}

/// Load every module of `set` which isn't already.
///
/// Optional modules which aren't installed are skipped quietly, and ones
/// which fail to load are logged.
///
/// # Errors
///
/// - If any required module failed to load, naming all of them
pub fn ensure(loader: &dyn ModuleLoader, set: &ModuleSet) -> Result<()> {
    info!(required = ?set.required, optional = ?set.optional, "checking kernel modules");
    let mut failed = Vec::new();
    for module in &set.required {
        if loader.is_loaded(module) {
            debug!(module = %module, "already loaded");
            continue;
        }
        match loader.load(module) {
            Ok(()) => info!(module = %module, "loaded"),
            Err(e) => {
                error!(module = %module, error = %e, "couldn't load required module");
                failed.push(module.clone());
            }
        }
    }
    for module in &set.optional {
        if loader.is_loaded(module) {
            continue;
        }
        if !loader.is_installed(module) {
            debug!(module = %module, "optional module not installed");
            continue;
        }
        match loader.load(module) {
            Ok(()) => info!(module = %module, "loaded"),
            Err(e) => debug!(module = %module, error = %e, "optional module not loaded"),
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(ModuleError::RequiredMissing(failed))
    }
}

/// Hardware name of the running machine.
pub fn machine() -> String {
    uname()
        .map(|u| u.machine().to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Loads modules with the system `modprobe`.
#[derive(Debug, Clone)]
pub struct Modprobe {
    sysfs_root: PathBuf,
    modules_root: PathBuf,
    timeout: Duration,
}

impl Default for Modprobe {
    fn default() -> Self {
        Self::new(SYSFS_PATH)
    }
}

// Public
impl Modprobe {
    /// Check for loaded modules under `sysfs_root`.
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            modules_root: MODULE_PATH.into(),
            timeout: MODPROBE_TIMEOUT,
        }
    }
}

// Private
impl Modprobe {
    fn sys_module(&self, name: &str) -> PathBuf {
        self.sysfs_root.join("module").join(name.replace('-', "_"))
    }

    /// `/lib/modules/(uname -r)`
    fn release_dir(&self) -> Option<PathBuf> {
        let uts = uname().ok()?;
        Some(self.modules_root.join(uts.release()))
    }
}

impl ModuleLoader for Modprobe {
    fn is_loaded(&self, name: &str) -> bool {
        if name == "crc32c" {
            return CRC32C_PROVIDERS
                .iter()
                .any(|p| self.sys_module(p).exists());
        }
        self.sys_module(name).exists()
    }

    fn is_installed(&self, name: &str) -> bool {
        let Some(dir) = self.release_dir() else {
            return false;
        };
        let wanted = name.replace('-', "_");
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .any(|e| module_name(e.path()).map_or(false, |m| m.replace('-', "_") == wanted))
    }

    fn load(&self, name: &str) -> Result<()> {
        debug!(module = name, "modprobe");
        let mut cmd = Command::new("modprobe");
        cmd.arg(name);
        let Some((status, stderr)) = run(cmd, self.timeout)? else {
            return Err(ModuleError::LoadError(name.into(), TIMED_OUT.into()));
        };
        if status.success() {
            return Ok(());
        }
        let reason = match stderr.trim() {
            "" => NOT_FOUND.to_owned(),
            s => s.to_owned(),
        };
        Err(ModuleError::LoadError(name.into(), reason))
    }
}

/// Run `cmd`, waiting at most `timeout` for it to exit.
///
/// Returns the exit status and the first [`STDERR_LIMIT`] bytes of stderr,
/// or `None` if it was killed for taking too long. Stderr is drained while
/// waiting, so a chatty child can't block on a full pipe.
fn run(mut cmd: Command, timeout: Duration) -> io::Result<Option<(ExitStatus, String)>> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;
    let stderr = child.stderr.take().map(drain);
    let start = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() >= timeout {
            child.kill()?;
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(50));
    };
    let stderr = stderr
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    Ok(Some((status, stderr)))
}

/// Read `pipe` to the end on a new thread, keeping [`STDERR_LIMIT`] bytes.
fn drain(mut pipe: ChildStderr) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut kept = Vec::new();
        let _ = (&mut pipe).take(STDERR_LIMIT).read_to_end(&mut kept);
        let _ = io::copy(&mut pipe, &mut io::sink());
        String::from_utf8_lossy(&kept).into_owned()
    })
}

/// Module name of the file at `path`, without any extensions.
///
/// Modules are `.ko` but can be compressed, `.ko.xz`.
fn module_name(path: &Path) -> Option<&str> {
    path.file_name()?.to_str()?.split('.').next()
}
