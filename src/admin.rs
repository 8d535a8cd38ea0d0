//! Applying, clearing and checking whole configurations.
//!
//! # Examples
//!
//! Apply a configuration file to the running system
//!
//! ```rust,no_run
//! # use scstadmin::admin::*;
//! let admin = ScstAdmin::new(Settings::default());
//! admin.apply_file("/etc/scst.conf".as_ref()).unwrap();
//! ```
//!
//! Print the running configuration
//!
//! ```rust,no_run
//! # use scstadmin::admin::*;
//! let admin = ScstAdmin::new(Settings::default());
//! print!("{}", admin.read_configuration().unwrap());
//! ```
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::{
    config::{parser, Configuration},
    error::{BestEffort, Error, Result},
    modules::{self, ModuleLoader, ModuleSet, Modprobe},
    reader::Reader,
    sysfs::{self, ControlFs, HostFs, Sysfs},
    util::{names::*, SCST_ROOT, SYSFS_PATH},
    writer::{self, Writer},
};

/// Runtime knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Root of the control plane.
    pub root: PathBuf,

    /// Where `/sys/module` lives.
    pub sysfs_root: PathBuf,

    /// How long asynchronous commands may take.
    pub mgmt_timeout: Duration,
    pub mgmt_poll_interval: Duration,

    /// How long target removal waits for sessions to close.
    pub session_timeout: Duration,
    pub session_poll_interval: Duration,

    /// Suspend I/O with this value while applying.
    pub suspend: Option<i64>,

    /// Load missing kernel modules before applying.
    pub load_modules: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: SCST_ROOT.into(),
            sysfs_root: SYSFS_PATH.into(),
            mgmt_timeout: sysfs::DEFAULT_TIMEOUT,
            mgmt_poll_interval: sysfs::DEFAULT_POLL_INTERVAL,
            session_timeout: writer::DEFAULT_SESSION_TIMEOUT,
            session_poll_interval: writer::DEFAULT_SESSION_POLL_INTERVAL,
            suspend: None,
            load_modules: true,
        }
    }
}

/// Entry point for whole-configuration operations.
///
/// Operations run one at a time, the suspend count is the only shared
/// state.
#[derive(Debug)]
pub struct ScstAdmin {
    sysfs: Sysfs,
    loader: Box<dyn ModuleLoader>,
    settings: Settings,
    suspended: Mutex<u32>,
}

/// Resumes I/O when dropped, see [`ScstAdmin::suspend`].
#[derive(Debug)]
#[must_use = "I/O resumes as soon as the guard is dropped"]
pub struct SuspendGuard<'a> {
    admin: &'a ScstAdmin,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.admin.resume_io().best_effort("resuming I/O");
    }
}

// Public
impl ScstAdmin {
    /// Administer the live system.
    pub fn new(settings: Settings) -> Self {
        let loader = Box::new(Modprobe::new(&settings.sysfs_root));
        Self::with_parts(Arc::new(HostFs), loader, settings)
    }

    /// Administer the control plane in `fs`, loading modules with `loader`.
    pub fn with_parts(
        fs: Arc<dyn ControlFs>,
        loader: Box<dyn ModuleLoader>,
        settings: Settings,
    ) -> Self {
        let sysfs = Sysfs::new(fs, &settings.root)
            .with_timeout(settings.mgmt_timeout, settings.mgmt_poll_interval);
        Self {
            sysfs,
            loader,
            settings,
            suspended: Mutex::new(0),
        }
    }

    pub fn sysfs(&self) -> &Sysfs {
        &self.sysfs
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The configuration as it is now.
    ///
    /// # Errors
    ///
    /// - If SCST isn't available
    pub fn read_configuration(&self) -> Result<Configuration> {
        Reader::new(&self.sysfs).read_configuration()
    }

    /// Parse the file at `path` and [apply](ScstAdmin::apply) it.
    ///
    /// # Errors
    ///
    /// - If the file couldn't be read or parsed
    /// - See [`ScstAdmin::apply`]
    pub fn apply_file(&self, path: &Path) -> Result<()> {
        let config = parser::parse_file(path)?;
        self.apply(&config)
    }

    /// Converge the system on `desired`.
    ///
    /// Steps run in a fixed order:
    ///
    /// 1. Load missing kernel modules
    /// 2. Remove what `desired` doesn't have
    /// 3. Devices
    /// 4. Targets, their LUNs and initiator groups
    /// 5. Copy manager LUN deduplication
    /// 6. Device groups and target groups
    /// 7. Enable targets, then drivers
    /// 8. Driver, handler and global attributes
    ///
    /// Nothing is rolled back on failure, applying again continues where
    /// this left off.
    ///
    /// # Errors
    ///
    /// - If a required module couldn't be loaded
    /// - If SCST isn't available
    /// - If a device, target, LUN or group couldn't be created
    pub fn apply(&self, desired: &Configuration) -> Result<()> {
        if self.settings.load_modules {
            let set = ModuleSet::for_config(desired, &modules::machine());
            modules::ensure(self.loader.as_ref(), &set)?;
        }
        self.check_available()?;
        let _guard = self.settings.suspend.map(|v| self.suspend(v)).transpose()?;

        let reader = Reader::new(&self.sysfs);
        let writer = self.writer(&reader);
        let live = reader.read_configuration()?;

        self.remove_conflicting(&writer, &live, desired);

        for dev in desired.devices.values() {
            writer.apply_device(dev)?;
        }
        for driver in desired.drivers.values() {
            writer.apply_driver(driver)?;
        }
        if let Some(cm) = desired.drivers.get(COPY_MANAGER) {
            writer.dedup_copy_manager(cm);
        }
        for dg in desired.device_groups.values() {
            writer.apply_device_group(dg)?;
        }
        self.enable(&writer, desired)?;

        for driver in desired.drivers.values() {
            writer.apply_driver_attributes(driver);
        }
        for (handler, attrs) in &desired.handlers {
            writer.apply_handler_attributes(handler, attrs);
        }
        let root = self.sysfs.root();
        let values = reader.values(root, desired.attributes.keys().map(String::as_str));
        writer.sync_attributes(root, &desired.attributes, &values);

        info!("configuration applied");
        Ok(())
    }

    /// Remove everything: drivers are disabled, then device groups, targets
    /// and devices removed.
    ///
    /// `copy_manager_tgt` is built in, so only its LUNs are cleared.
    ///
    /// # Errors
    ///
    /// - If SCST isn't available
    pub fn clear(&self) -> Result<()> {
        self.check_available()?;
        let _guard = self.settings.suspend.map(|v| self.suspend(v)).transpose()?;

        let reader = Reader::new(&self.sysfs);
        let writer = self.writer(&reader);
        let live = reader.read_configuration()?;

        for name in live.drivers.keys() {
            let dir = self.sysfs.driver(name);
            if self.sysfs.exists(&dir.join(ENABLED)) {
                writer.set_enabled(&dir, false).best_effort("disabling driver");
            }
        }
        for name in live.device_groups.keys() {
            writer
                .remove_device_group(name)
                .best_effort("removing device group");
        }
        for (driver, d) in &live.drivers {
            for target in d.targets.keys() {
                writer.clear_target_attributes(driver, target);
                if driver == COPY_MANAGER && target == COPY_MANAGER_TGT {
                    writer.clear_copy_manager();
                } else if let Some(report) = writer
                    .remove_target(driver, target)
                    .best_effort("removing target")
                {
                    debug!(driver = %driver, target = %target, ?report, "target removed");
                }
            }
        }
        for driver in live.drivers.keys() {
            writer.clear_driver_attributes(driver);
        }
        writer.remove_all_devices();

        info!("configuration cleared");
        Ok(())
    }

    /// Whether `text` is a valid configuration.
    ///
    /// The reason it isn't is logged.
    pub fn check_configuration(text: &str) -> bool {
        match parser::parse(text) {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "configuration check failed");
                false
            }
        }
    }

    /// Whether the file at `path` is a valid configuration.
    pub fn check_file(path: &Path) -> bool {
        match parser::parse_file(path) {
            Ok(_) => true,
            Err(e) => {
                error!(path = %path.display(), error = %e, "configuration check failed");
                false
            }
        }
    }

    /// Suspend I/O with `value` until the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// - See [`ScstAdmin::suspend_io`]
    pub fn suspend(&self, value: i64) -> Result<SuspendGuard<'_>> {
        self.suspend_io(value)?;
        Ok(SuspendGuard { admin: self })
    }

    /// Suspend I/O.
    ///
    /// Calls nest, only the outermost one writes `value`.
    ///
    /// # Errors
    ///
    /// - If `value` isn't positive
    /// - If writing the suspend file failed
    pub fn suspend_io(&self, value: i64) -> Result<()> {
        if value <= 0 {
            return Err(Error::InvalidSuspend(value));
        }
        let mut count = self.suspended.lock();
        if *count == 0 {
            let path = self.sysfs.root().join(SUSPEND);
            self.sysfs.write(&path, &value.to_string(), true)?;
            info!(value, "suspended I/O");
        }
        *count += 1;
        Ok(())
    }

    /// Undo one [`ScstAdmin::suspend_io`].
    ///
    /// The last one resumes I/O. Without a matching suspend this does
    /// nothing.
    ///
    /// # Errors
    ///
    /// - If writing the suspend file failed
    pub fn resume_io(&self) -> Result<()> {
        let mut count = self.suspended.lock();
        match *count {
            0 => return Ok(()),
            1 => {
                let path = self.sysfs.root().join(SUSPEND);
                *count = 0;
                self.sysfs.write(&path, "-1", true)?;
                info!("resumed I/O");
            }
            _ => *count -= 1,
        }
        Ok(())
    }
}

// Private
impl ScstAdmin {
    fn check_available(&self) -> Result<()> {
        if self.sysfs.available() {
            Ok(())
        } else {
            Err(Error::Unavailable(self.sysfs.root().into()))
        }
    }

    fn writer<'a>(&self, reader: &'a Reader<'a>) -> Writer<'a> {
        Writer::new(reader).with_session_timeout(
            self.settings.session_timeout,
            self.settings.session_poll_interval,
        )
    }

    /// Remove what's live but not desired, so creation can't conflict.
    ///
    /// Everything here is best effort. The copy manager is left alone unless
    /// `desired` configures it, and its target is never removed.
    fn remove_conflicting(&self, writer: &Writer<'_>, live: &Configuration, desired: &Configuration) {
        for name in live
            .device_groups
            .keys()
            .filter(|g| !desired.device_groups.contains_key(*g))
        {
            writer
                .remove_device_group(name)
                .best_effort("removing device group");
        }

        for (name, driver) in &live.drivers {
            let wanted = desired.drivers.get(name);
            if name == COPY_MANAGER && wanted.is_none() {
                continue;
            }
            for (target_name, target) in &driver.targets {
                if name == COPY_MANAGER && target_name == COPY_MANAGER_TGT {
                    continue;
                }
                match wanted.and_then(|d| d.targets.get(target_name)) {
                    Some(want) => writer.prune_target(name, target, want),
                    None => {
                        if let Some(report) = writer
                            .remove_target(name, target_name)
                            .best_effort("removing target")
                        {
                            debug!(driver = %name, target = %target_name, ?report, "target removed");
                        }
                    }
                }
            }
            if let Some(wanted) = wanted {
                writer.reset_driver_attributes(driver, wanted);
            }
        }

        for name in live
            .devices
            .keys()
            .filter(|d| !desired.devices.contains_key(*d))
        {
            writer.remove_device(name).best_effort("removing device");
        }
    }

    /// Step 7, targets first.
    fn enable(&self, writer: &Writer<'_>, desired: &Configuration) -> Result<()> {
        for driver in desired.drivers.values() {
            for target in driver.targets.values() {
                if let Some(v) = target.attributes.get(ENABLED) {
                    let dir = self.sysfs.target(&driver.name, &target.name);
                    writer.set_enabled(&dir, v == "1")?;
                }
            }
        }
        for driver in desired.drivers.values() {
            if let Some(v) = driver.attributes.get(ENABLED) {
                writer.set_enabled(&self.sysfs.driver(&driver.name), v == "1")?;
            }
        }
        Ok(())
    }
}
