//! Drivers, targets, LUNs and initiator groups.
use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
    thread,
    time::Instant,
};

use tracing::{debug, info, warn};

use super::{decide, differs, membership, Action, LiveAttributes, Writer};
use crate::{
    config::{Attributes, Driver, InitiatorGroup, Luns, Target},
    error::{BestEffort, Result, SysfsError},
    sysfs::MgmtInfo,
    util::{names::*, normalize_initiator, split_values},
};

/// Values static driver attributes are reset to, when known.
const DRIVER_DEFAULTS: &[(&str, &str, &str)] = &[
    ("iscsi", "iSNSServer", "\n"),
    ("iscsi", "internal_portal", "\n"),
    ("iscsi", "link_local", "1"),
    ("iscsi", "trace_level", "0"),
];

/// Reset value for everything else.
const EMPTY: &str = "\n";

fn driver_default(driver: &str, attr: &str) -> &'static str {
    DRIVER_DEFAULTS
        .iter()
        .find(|(d, a, _)| *d == driver && *a == attr)
        .map_or(EMPTY, |(_, _, v)| *v)
}

/// `k=v;k=v;` for a creation command.
fn params(attrs: &Attributes) -> String {
    attrs.iter().map(|(k, v)| format!("{k}={v};")).collect()
}

/// Split `attrs` into those named in `keys` and the rest.
fn split_creation(
    attrs: &Attributes,
    keys: &BTreeSet<String>,
) -> (Attributes, Attributes) {
    attrs
        .iter()
        .filter(|(k, _)| *k != ENABLED)
        .map(|(k, v)| (k.clone(), v.clone()))
        .partition(|(k, _)| keys.contains(k))
}

fn is_copy_manager(driver: &str, target: &str) -> bool {
    driver == COPY_MANAGER && target == COPY_MANAGER_TGT
}

/// What happened to a target's sessions during removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionClose {
    /// There were none.
    None,

    /// All of this many closed in time.
    Closed(usize),

    /// These were still open when time ran out.
    TimedOut(Vec<String>),
}

/// Outcome of [`Writer::remove_target`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalReport {
    /// Whether the target was disabled first.
    pub disabled: bool,
    pub sessions: SessionClose,
}

// Public
impl Writer<'_> {
    /// Create or update every target of `driver`, with their LUNs and
    /// initiator groups.
    ///
    /// # Errors
    ///
    /// - If the driver isn't loaded
    /// - If a target, LUN or group couldn't be created
    pub fn apply_driver(&self, driver: &Driver) -> Result<()> {
        let dir = self.sysfs.driver(&driver.name);
        if !self.sysfs.is_dir(&dir) {
            return Err(SysfsError::Missing(dir).into());
        }
        let info = self.reader.driver_info(&driver.name);
        let has_virtual = driver
            .targets
            .values()
            .any(|t| t.attributes.keys().any(|k| info.create_params.contains(k)));
        if has_virtual {
            self.enable_hardware_targets(driver);
        }
        for target in driver.targets.values() {
            self.apply_target(&driver.name, target, &info)?;
        }
        Ok(())
    }

    /// Create, update or recreate one target, then sync its LUNs and groups.
    ///
    /// # Errors
    ///
    /// - See [`Writer::apply_driver`]
    pub fn apply_target(&self, driver: &str, target: &Target, info: &MgmtInfo) -> Result<()> {
        let name = target.name.as_str();
        let dir = self.sysfs.target(driver, name);
        let copy_manager = is_copy_manager(driver, name);
        let (creation, settable) = split_creation(&target.attributes, &info.create_params);

        if !self.sysfs.is_dir(&dir) {
            if copy_manager {
                warn!(driver, target = name, "copy manager target missing, skipping");
                return Ok(());
            }
            self.create_target(driver, name, &creation)?;
            self.set_target_attributes(driver, name, &settable, &Attributes::new(), info);
        } else {
            self.update_target(driver, target, &creation, &settable, info)?;
        }

        let live = self.reader.target(driver, name, info);
        self.sync_luns(&dir.join(LUNS), &target.luns, &live.luns, copy_manager)?;
        self.sync_groups(driver, target, &live)
    }

    /// Remove target `name` of driver `driver`.
    ///
    /// The target is disabled and its sessions force-closed first, which
    /// may take up to the session timeout. Sessions which don't close in
    /// time don't stop removal. LUNs and initiator groups go next, then
    /// the target itself.
    ///
    /// # Errors
    ///
    /// - If `del_target` fails
    pub fn remove_target(&self, driver: &str, name: &str) -> Result<RemovalReport> {
        let dir = self.sysfs.target(driver, name);
        let enabled = dir.join(ENABLED);
        let disabled = self.sysfs.exists(&enabled)
            && self
                .sysfs
                .write(&enabled, "0", true)
                .best_effort("disabling target")
                .is_some();

        let sessions = self.close_sessions(driver, name);

        self.sysfs
            .mgmt(&dir.join(LUNS).join(MGMT), "clear", "")
            .best_effort("clearing LUNs");
        let groups = dir.join(INI_GROUPS);
        for group in self.reader.subdirs(&groups) {
            self.remove_group(&groups, &group)
                .best_effort("removing initiator group");
        }

        let mgmt = self.sysfs.driver(driver).join(MGMT);
        self.sysfs.mgmt(&mgmt, "del_target", name)?;
        info!(driver, target = name, "removed target");
        Ok(RemovalReport { disabled, sessions })
    }

    /// Force-close every session of a target and wait for them to go.
    pub fn close_sessions(&self, driver: &str, name: &str) -> SessionClose {
        let sessions = self.reader.sessions(driver, name);
        if sessions.is_empty() {
            return SessionClose::None;
        }
        let dir = self.sysfs.target(driver, name).join(SESSIONS);
        for session in &sessions {
            let path = dir.join(session).join(FORCE_CLOSE);
            if self.sysfs.exists(&path) {
                self.sysfs
                    .write(&path, "1", false)
                    .best_effort("force-closing session");
            }
        }

        let start = Instant::now();
        loop {
            let open: Vec<String> = self
                .reader
                .sessions(driver, name)
                .intersection(&sessions)
                .cloned()
                .collect();
            if open.is_empty() {
                debug!(driver, target = name, count = sessions.len(), "sessions closed");
                return SessionClose::Closed(sessions.len());
            }
            if start.elapsed() >= self.session_timeout {
                warn!(driver, target = name, sessions = ?open, "sessions did not close in time");
                return SessionClose::TimedOut(open);
            }
            thread::sleep(self.session_poll_interval);
        }
    }

    /// Remove LUNs and initiator groups of `live` which `desired` lacks.
    ///
    /// Failures are logged and skipped.
    pub fn prune_target(&self, driver: &str, live: &Target, desired: &Target) {
        let dir = self.sysfs.target(driver, &live.name);
        let mgmt = dir.join(LUNS).join(MGMT);
        for number in live.luns.keys().filter(|n| !desired.luns.contains_key(*n)) {
            if self
                .sysfs
                .mgmt(&mgmt, "del", number)
                .best_effort("removing LUN")
                .is_some()
            {
                info!(driver, target = %live.name, lun = %number, "removed LUN");
            }
        }
        let groups = dir.join(INI_GROUPS);
        for group in live.groups.keys().filter(|g| !desired.groups.contains_key(*g)) {
            self.remove_group(&groups, group)
                .best_effort("removing initiator group");
        }
    }

    /// Sync the LUNs under `dir`, a `luns` directory, to `desired`.
    ///
    /// Extra live LUNs are removed, unless `auto_managed` is set. Then a
    /// device already exported under another number is removed first.
    ///
    /// # Errors
    ///
    /// - If a LUN couldn't be added, or replaced
    pub fn sync_luns(
        &self,
        dir: &Path,
        desired: &Luns,
        live: &Luns,
        auto_managed: bool,
    ) -> Result<()> {
        let mgmt = dir.join(MGMT);
        let params = self.reader.mgmt_info(&mgmt).create_params;
        let keys: Vec<&str> = params.iter().map(String::as_str).collect();
        let mut live = live.clone();

        if !auto_managed {
            let extra: Vec<String> = live
                .keys()
                .filter(|n| !desired.contains_key(*n))
                .cloned()
                .collect();
            for number in extra {
                self.sysfs
                    .mgmt(&mgmt, "del", &number)
                    .best_effort("removing LUN");
                live.shift_remove(&number);
            }
        }

        for (number, lun) in desired {
            let Some(device) = lun.device.as_deref() else {
                warn!(lun = %number, dir = %dir.display(), "LUN has no device, skipping");
                continue;
            };
            if auto_managed {
                let moved: Vec<String> = live
                    .iter()
                    .filter(|(n, l)| *n != number && l.device.as_deref() == Some(device))
                    .map(|(n, _)| n.clone())
                    .collect();
                for n in moved {
                    debug!(device, from = %n, to = %number, "moving LUN");
                    self.sysfs
                        .mgmt(&mgmt, "del", &n)
                        .best_effort("removing duplicate LUN");
                    live.shift_remove(&n);
                }
            }

            let (creation, post) = split_creation(&lun.attributes, &params);
            match live.get(number) {
                Some(current) if current.device.as_deref() == Some(device) => {
                    let lun_dir = dir.join(number);
                    let mut values = self
                        .reader
                        .values(&lun_dir, lun.attributes.keys().map(String::as_str));
                    // Parameters without a file can't have changed
                    for (k, v) in &creation {
                        if !self.sysfs.exists(&lun_dir.join(k)) {
                            values.insert(k.clone(), v.clone());
                        }
                    }
                    let state = LiveAttributes {
                        values,
                        non_default: current.attributes.clone(),
                    };
                    match decide(&creation, &post, &state, &keys) {
                        Action::Skip => {}
                        Action::Update => {
                            self.sync_attributes(&lun_dir, &post, &state.values);
                        }
                        Action::Recreate => {
                            self.sysfs.mgmt(&mgmt, "del", number)?;
                            self.add_lun(dir, number, device, &creation, &post)?;
                        }
                    }
                }
                Some(_) => {
                    info!(lun = %number, device, "reassigning LUN");
                    self.sysfs.mgmt(&mgmt, "del", number)?;
                    self.add_lun(dir, number, device, &creation, &post)?;
                }
                None => self.add_lun(dir, number, device, &creation, &post)?,
            }
        }
        Ok(())
    }

    /// Remove copy manager LUNs which conflict with the explicit ones in
    /// `desired`.
    ///
    /// A LUN for an explicitly configured device at another number goes,
    /// and so does any LUN for a device which isn't configured at all.
    /// Nothing is removed unless at least one LUN names a device.
    pub fn dedup_copy_manager(&self, desired: &Driver) {
        let Some(target) = desired.targets.get(COPY_MANAGER_TGT) else {
            return;
        };
        let explicit: HashMap<&str, &str> = target
            .luns
            .iter()
            .filter_map(|(n, l)| Some((l.device.as_deref()?, n.as_str())))
            .collect();
        if explicit.is_empty() {
            return;
        }
        let dir = self.sysfs.target(COPY_MANAGER, COPY_MANAGER_TGT).join(LUNS);
        let mgmt = dir.join(MGMT);
        for (number, lun) in self.reader.luns(&dir) {
            let Some(device) = lun.device else {
                continue;
            };
            let keep = explicit.get(device.as_str()) == Some(&number.as_str());
            if keep {
                continue;
            }
            if self
                .sysfs
                .mgmt(&mgmt, "del", &number)
                .best_effort("removing copy manager LUN")
                .is_some()
            {
                info!(lun = %number, device = %device, "removed copy manager LUN");
            }
        }
    }

    /// Set the `enabled` flag under `dir` to `on`, if it isn't already.
    ///
    /// Returns whether anything was written.
    ///
    /// # Errors
    ///
    /// - If the flag doesn't exist, or the write fails
    pub fn set_enabled(&self, dir: &Path, on: bool) -> Result<bool> {
        let path = dir.join(ENABLED);
        let want = if on { "1" } else { "0" };
        if self.sysfs.read_attribute(&path)? == want {
            return Ok(false);
        }
        self.sysfs.write(&path, want, true)?;
        info!(path = %dir.display(), enabled = on, "toggled");
        Ok(true)
    }

    /// Enable the hardware targets of `driver` which it wants enabled.
    ///
    /// Virtual targets can only be created on top of an enabled hardware
    /// target.
    pub fn enable_hardware_targets(&self, driver: &Driver) {
        for name in self.reader.target_names(&driver.name) {
            let wanted = driver
                .targets
                .get(&name)
                .and_then(|t| t.attributes.get(ENABLED))
                .map_or(false, |v| v == "1");
            if !wanted {
                continue;
            }
            let dir = self.sysfs.target(&driver.name, &name);
            let hw = self.sysfs.read_attribute(&dir.join(HW_TARGET));
            let enabled = self.sysfs.read_attribute(&dir.join(ENABLED));
            if hw.ok().as_deref() != Some("1") || enabled.ok().as_deref() == Some("1") {
                continue;
            }
            debug!(driver = %driver.name, target = %name, "enabling hardware target");
            self.sysfs
                .write(&dir.join(ENABLED), "1", false)
                .best_effort("enabling hardware target");
        }
    }

    /// Write driver-level attributes that differ.
    ///
    /// Dynamic attributes are synced value by value through the driver's
    /// `mgmt` file, static ones written directly if writable.
    pub fn apply_driver_attributes(&self, driver: &Driver) {
        let name = driver.name.as_str();
        let dir = self.sysfs.driver(name);
        let info = self.reader.driver_info(name);
        let mgmt = dir.join(MGMT);
        for (key, value) in &driver.attributes {
            if key == ENABLED || key == MGMT {
                continue;
            }
            if info.driver_attributes.contains(key) {
                let current: Vec<String> = self
                    .reader
                    .driver_attribute_values(name, key)
                    .map(|v| split_values(&v).map(String::from).collect())
                    .unwrap_or_default();
                let wanted: Vec<String> = split_values(value).map(String::from).collect();
                let diff = membership(&current, &wanted);
                for v in diff.remove {
                    self.sysfs
                        .mgmt(&mgmt, "del_attribute", &format!("{key} {v}"))
                        .best_effort("removing driver attribute");
                }
                for v in diff.add {
                    self.sysfs
                        .mgmt(&mgmt, "add_attribute", &format!("{key} {v}"))
                        .best_effort("adding driver attribute");
                }
                continue;
            }
            let path = dir.join(key);
            if !self.sysfs.writable(&path) {
                debug!(driver = name, key = %key, "not writable, skipping");
                continue;
            }
            let current = self.sysfs.read_attribute(&path).ok();
            if differs(value, current.as_ref()) {
                self.sysfs
                    .write(&path, value, true)
                    .best_effort("setting driver attribute");
            }
        }
    }

    /// Reset driver attributes set on `live` which `desired` lacks.
    pub fn reset_driver_attributes(&self, live: &Driver, desired: &Driver) {
        let name = live.name.as_str();
        let dir = self.sysfs.driver(name);
        let info = self.reader.driver_info(name);
        let mgmt = dir.join(MGMT);
        for (key, value) in &live.attributes {
            if key == ENABLED || desired.attributes.contains_key(key) {
                continue;
            }
            if info.driver_attributes.contains(key) {
                for v in split_values(value) {
                    self.sysfs
                        .mgmt(&mgmt, "del_attribute", &format!("{key} {v}"))
                        .best_effort("removing driver attribute");
                }
                continue;
            }
            let path = dir.join(key);
            if self.sysfs.writable(&path) {
                debug!(driver = name, key = %key, "resetting to default");
                self.sysfs
                    .write(&path, driver_default(name, key), true)
                    .best_effort("resetting driver attribute");
            }
        }
    }

    /// Remove every value of every dynamic attribute of a target.
    pub fn clear_target_attributes(&self, driver: &str, target: &str) {
        let info = self.reader.driver_info(driver);
        let dir = self.sysfs.target(driver, target);
        let mgmt = self.sysfs.driver(driver).join(MGMT);
        for attr in &info.target_attributes {
            let Some(values) = self.reader.numbered_values(&dir, attr) else {
                continue;
            };
            for v in split_values(&values) {
                self.sysfs
                    .mgmt(&mgmt, "del_target_attribute", &format!("{target} {attr} {v}"))
                    .best_effort("removing target attribute");
            }
        }
    }

    /// Remove every value of every dynamic attribute of a driver.
    pub fn clear_driver_attributes(&self, driver: &str) {
        let info = self.reader.driver_info(driver);
        let mgmt = self.sysfs.driver(driver).join(MGMT);
        for attr in &info.driver_attributes {
            let Some(values) = self.reader.driver_attribute_values(driver, attr) else {
                continue;
            };
            for v in split_values(&values) {
                self.sysfs
                    .mgmt(&mgmt, "del_attribute", &format!("{attr} {v}"))
                    .best_effort("removing driver attribute");
            }
        }
    }

    /// Remove every LUN of the copy manager target.
    pub fn clear_copy_manager(&self) {
        let mgmt = self
            .sysfs
            .target(COPY_MANAGER, COPY_MANAGER_TGT)
            .join(LUNS)
            .join(MGMT);
        if self.sysfs.exists(&mgmt) {
            self.sysfs
                .mgmt(&mgmt, "clear", "")
                .best_effort("clearing copy manager LUNs");
        }
    }
}

// Private
impl Writer<'_> {
    fn create_target(&self, driver: &str, name: &str, creation: &Attributes) -> Result<()> {
        let mgmt = self.sysfs.driver(driver).join(MGMT);
        let argument = if creation.is_empty() {
            name.to_owned()
        } else {
            format!("{name} {}", params(creation))
        };
        self.sysfs.mgmt(&mgmt, "add_target", &argument)?;
        info!(driver, target = name, "created target");
        Ok(())
    }

    fn update_target(
        &self,
        driver: &str,
        target: &Target,
        creation: &Attributes,
        settable: &Attributes,
        info: &MgmtInfo,
    ) -> Result<()> {
        let name = target.name.as_str();
        let observed = self.reader.target(driver, name, info);
        let keys = creation.keys().chain(settable.keys()).map(String::as_str);
        let mut values = self.reader.target_values(driver, name, keys, info);
        // Parameters which can't be read back can't have changed
        for (k, v) in creation {
            values.entry(k.clone()).or_insert_with(|| v.clone());
        }
        let state = LiveAttributes {
            values,
            non_default: observed.attributes.clone(),
        };
        let stale: Vec<&String> = info
            .target_attributes
            .iter()
            .filter(|a| observed.attributes.contains_key(*a) && !target.attributes.contains_key(*a))
            .collect();

        let creation_keys: Vec<&str> = info.create_params.iter().map(String::as_str).collect();
        let mut action = decide(creation, settable, &state, &creation_keys);
        if !stale.is_empty() {
            action = action.max(Action::Update);
        }
        match action {
            Action::Skip => debug!(driver, target = name, "up to date"),
            Action::Update => {
                info!(driver, target = name, "updating");
                self.set_target_attributes(driver, name, settable, &state.values, info);
                let mgmt = self.sysfs.driver(driver).join(MGMT);
                for attr in stale {
                    for v in split_values(&observed.attributes[attr]) {
                        self.sysfs
                            .mgmt(&mgmt, "del_target_attribute", &format!("{name} {attr} {v}"))
                            .best_effort("removing target attribute");
                    }
                }
            }
            Action::Recreate if is_copy_manager(driver, name) => {
                warn!(driver, target = name, "copy manager target can't be recreated");
            }
            Action::Recreate => {
                info!(driver, target = name, "creation parameters changed, recreating");
                self.remove_target(driver, name)?;
                self.create_target(driver, name, creation)?;
                self.set_target_attributes(driver, name, settable, &Attributes::new(), info);
            }
        }
        Ok(())
    }

    /// Write target attributes that differ from `live`.
    ///
    /// Dynamic ones have every live value deleted, then every desired value
    /// added.
    fn set_target_attributes(
        &self,
        driver: &str,
        name: &str,
        desired: &Attributes,
        live: &Attributes,
        info: &MgmtInfo,
    ) {
        let dir = self.sysfs.target(driver, name);
        let mgmt = self.sysfs.driver(driver).join(MGMT);
        for (key, value) in desired {
            if !differs(value, live.get(key)) {
                continue;
            }
            if !info.target_attributes.contains(key) {
                self.sysfs
                    .write(&dir.join(key), value, false)
                    .best_effort("setting target attribute");
                continue;
            }
            for v in live.get(key).map(|v| split_values(v)).into_iter().flatten() {
                self.sysfs
                    .mgmt(&mgmt, "del_target_attribute", &format!("{name} {key} {v}"))
                    .best_effort("removing target attribute");
            }
            for v in split_values(value) {
                self.sysfs
                    .mgmt(&mgmt, "add_target_attribute", &format!("{name} {key} {v}"))
                    .best_effort("adding target attribute");
            }
        }
    }

    fn add_lun(
        &self,
        dir: &Path,
        number: &str,
        device: &str,
        creation: &Attributes,
        post: &Attributes,
    ) -> Result<()> {
        let mut argument = format!("{device} {number}");
        if !creation.is_empty() {
            argument.push(' ');
            argument.push_str(&params(creation));
        }
        self.sysfs.mgmt(&dir.join(MGMT), "add", &argument)?;
        info!(lun = number, device, dir = %dir.display(), "added LUN");

        let lun_dir = dir.join(number);
        let live = self.reader.values(&lun_dir, post.keys().map(String::as_str));
        self.sync_attributes(&lun_dir, post, &live);
        Ok(())
    }

    /// Sync the initiator groups of `target`, given its `live` state.
    fn sync_groups(&self, driver: &str, target: &Target, live: &Target) -> Result<()> {
        let groups = self.sysfs.target(driver, &target.name).join(INI_GROUPS);
        for name in live.groups.keys().filter(|g| !target.groups.contains_key(*g)) {
            self.remove_group(&groups, name)
                .best_effort("removing initiator group");
        }
        for group in target.groups.values() {
            let current = match live.groups.get(&group.name) {
                Some(current) => current.clone(),
                None => {
                    self.sysfs.mgmt(&groups.join(MGMT), "create", &group.name)?;
                    info!(target = %target.name, group = %group.name, "created initiator group");
                    InitiatorGroup::default()
                }
            };
            self.sync_group(&groups.join(&group.name), group, &current)?;
        }
        Ok(())
    }

    fn sync_group(&self, dir: &Path, group: &InitiatorGroup, live: &InitiatorGroup) -> Result<()> {
        let have: Vec<String> = live.initiators.iter().map(|i| normalize_initiator(i)).collect();
        let want: Vec<String> = group.initiators.iter().map(|i| normalize_initiator(i)).collect();
        let diff = membership(&have, &want);
        let mgmt = dir.join(INITIATORS).join(MGMT);
        for ini in diff.remove {
            self.sysfs
                .mgmt(&mgmt, "del", ini)
                .best_effort("removing initiator");
        }
        for ini in diff.add {
            self.sysfs.mgmt(&mgmt, "add", ini)?;
            debug!(group = %group.name, initiator = ini, "added initiator");
        }

        self.sync_luns(&dir.join(LUNS), &group.luns, &live.luns, false)?;

        let values = self
            .reader
            .values(dir, group.attributes.keys().map(String::as_str));
        self.sync_attributes(dir, &group.attributes, &values);
        Ok(())
    }

    /// Clear the LUNs of group `name` under `groups`, then delete it.
    fn remove_group(&self, groups: &Path, name: &str) -> Result<()> {
        let luns: PathBuf = groups.join(name).join(LUNS).join(MGMT);
        self.sysfs
            .mgmt(&luns, "clear", "")
            .best_effort("clearing group LUNs");
        self.sysfs.mgmt(&groups.join(MGMT), "del", name)?;
        info!(group = name, "removed initiator group");
        Ok(())
    }
}
