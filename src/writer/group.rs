//! ALUA device groups and target groups.
use std::path::Path;

use tracing::{debug, info, warn};

use super::{membership, Writer};
use crate::{
    config::{DeviceGroup, TargetGroup},
    error::{BestEffort, Result},
    sysfs::EntryKind,
    util::names::*,
};

// Public
impl Writer<'_> {
    /// Create device group `dg` if needed, then sync its devices, target
    /// groups and attributes.
    ///
    /// # Errors
    ///
    /// - If the group, a target group or a member couldn't be added
    pub fn apply_device_group(&self, dg: &DeviceGroup) -> Result<()> {
        let dir = self.sysfs.device_group(&dg.name);
        if !self.sysfs.is_dir(&dir) {
            let mgmt = self.sysfs.device_groups().join(MGMT);
            self.sysfs.mgmt(&mgmt, "create", &dg.name)?;
            info!(group = %dg.name, "created device group");
        }
        let live = self.reader.device_group(&dg.name);

        let mgmt = dir.join(DEVICES).join(MGMT);
        let diff = membership(&live.devices, &dg.devices);
        for dev in diff.remove {
            self.sysfs
                .mgmt(&mgmt, "del", dev)
                .best_effort("removing device group member");
        }
        for dev in diff.add {
            self.sysfs.mgmt(&mgmt, "add", dev)?;
            debug!(group = %dg.name, device = dev, "added device");
        }

        let tgs = dir.join(TARGET_GROUPS);
        let mgmt = tgs.join(MGMT);
        for name in live
            .target_groups
            .keys()
            .filter(|tg| !dg.target_groups.contains_key(*tg))
        {
            self.sysfs
                .mgmt(&mgmt, "del", name)
                .best_effort("removing target group");
        }
        for tg in dg.target_groups.values() {
            if !live.target_groups.contains_key(&tg.name) {
                self.sysfs.mgmt(&mgmt, "add", &tg.name)?;
                info!(group = %dg.name, target_group = %tg.name, "created target group");
            }
            self.apply_target_group(&tgs.join(&tg.name), tg)?;
        }

        let values = self
            .reader
            .values(&dir, dg.attributes.keys().map(String::as_str));
        self.sync_attributes(&dir, &dg.attributes, &values);
        Ok(())
    }

    /// Delete device group `name`, emptying it first.
    ///
    /// Target groups go, then devices, then the group itself.
    ///
    /// # Errors
    ///
    /// - If `del` of the group fails
    pub fn remove_device_group(&self, name: &str) -> Result<()> {
        let dir = self.sysfs.device_group(name);
        for sub in [TARGET_GROUPS, DEVICES] {
            let members = dir.join(sub);
            let mgmt = members.join(MGMT);
            for member in self.sysfs.list(&members) {
                if member == MGMT {
                    continue;
                }
                self.sysfs
                    .mgmt(&mgmt, "del", &member)
                    .best_effort("emptying device group");
            }
        }
        let mgmt = self.sysfs.device_groups().join(MGMT);
        self.sysfs.mgmt(&mgmt, "del", name)?;
        info!(group = name, "removed device group");
        Ok(())
    }
}

// Private
impl Writer<'_> {
    /// Sync target group members, its attributes, then per-target ones.
    ///
    /// Members are added before their attributes are set. Symlinked members
    /// can't carry attributes and are left alone.
    fn apply_target_group(&self, dir: &Path, tg: &TargetGroup) -> Result<()> {
        let live = self.reader.target_group(dir, &tg.name);
        let mgmt = dir.join(MGMT);
        let diff = membership(&live.targets, &tg.targets);
        for target in diff.remove {
            self.sysfs
                .mgmt(&mgmt, "del", target)
                .best_effort("removing target group member");
        }
        for target in diff.add {
            self.sysfs.mgmt(&mgmt, "add", target)?;
            debug!(target_group = %tg.name, target = %target, "added target");
        }

        let values = self
            .reader
            .values(dir, tg.attributes.keys().map(String::as_str));
        self.sync_attributes(dir, &tg.attributes, &values);

        for (target, attrs) in &tg.target_attributes {
            let path = dir.join(target);
            match self.sysfs.kind(&path) {
                Some(EntryKind::Dir) => {
                    let values = self.reader.values(&path, attrs.keys().map(String::as_str));
                    self.sync_attributes(&path, attrs, &values);
                }
                Some(EntryKind::Symlink) => {
                    warn!(target_group = %tg.name, target = %target, "symlinked target can't carry attributes");
                }
                _ => warn!(target_group = %tg.name, target = %target, "target not in group"),
            }
        }
        Ok(())
    }
}
