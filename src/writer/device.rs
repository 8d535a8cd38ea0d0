//! Devices.
use tracing::{debug, info};

use super::{decide, Action, LiveAttributes, Writer};
use crate::{
    config::{Attributes, Device},
    error::{BestEffort, Result, SysfsError},
    sysfs::EntryKind,
    util::names::*,
};

/// Handler entries which are never devices.
const HANDLER_ENTRIES: &[&str] = &[MGMT, "type", "trace_level"];

// Public
impl Writer<'_> {
    /// Create, update or recreate device `dev`.
    ///
    /// A device whose handler changed is always recreated. Creating a
    /// missing device counts as [`Action::Recreate`].
    ///
    /// # Errors
    ///
    /// - If the device couldn't be created or deleted
    pub fn apply_device(&self, dev: &Device) -> Result<Action> {
        let name = dev.name.as_str();
        let Some(handler) = self.reader.device_handler(name) else {
            self.create_device(dev)?;
            return Ok(Action::Recreate);
        };
        if handler != dev.handler.name() {
            info!(device = name, from = %handler, to = %dev.handler, "handler changed");
            self.delete_device(&handler, name)?;
            self.create_device(dev)?;
            return Ok(Action::Recreate);
        }

        let live = self.live_device(dev);
        let action = decide(
            &dev.creation_attributes,
            &dev.attributes,
            &live,
            &dev.handler.creation_keys(),
        );
        match action {
            Action::Skip => debug!(device = name, "up to date"),
            Action::Update => {
                info!(device = name, "updating");
                self.sync_attributes(&self.sysfs.device(name), &dev.attributes, &live.values);
            }
            Action::Recreate => {
                info!(device = name, "creation attributes changed, recreating");
                self.delete_device(&handler, name)?;
                self.create_device(dev)?;
            }
        }
        Ok(action)
    }

    /// Create device `dev`, then set its post-creation attributes.
    ///
    /// # Errors
    ///
    /// - If `add_device` fails
    pub fn create_device(&self, dev: &Device) -> Result<()> {
        let mgmt = self.sysfs.handler(dev.handler.name()).join(MGMT);
        self.sysfs.mgmt(&mgmt, "add_device", &dev.add_argument())?;
        info!(device = %dev.name, handler = %dev.handler, "created device");

        let dir = self.sysfs.device(&dev.name);
        let live = self
            .reader
            .values(&dir, dev.attributes.keys().map(String::as_str));
        self.sync_attributes(&dir, &dev.attributes, &live);
        Ok(())
    }

    /// Delete device `name`, wherever it lives.
    ///
    /// # Errors
    ///
    /// - If the device doesn't exist
    /// - If `del_device` fails
    pub fn remove_device(&self, name: &str) -> Result<()> {
        let handler = self
            .reader
            .device_handler(name)
            .or_else(|| self.find_handler(name))
            .ok_or_else(|| SysfsError::Missing(self.sysfs.device(name)))?;
        self.delete_device(&handler, name)
    }

    /// Delete every device of every handler.
    pub fn remove_all_devices(&self) {
        for handler in self.sysfs.list(&self.sysfs.handlers()) {
            let dir = self.sysfs.handler(&handler);
            for entry in self.sysfs.list(&dir) {
                if HANDLER_ENTRIES.contains(&entry.as_str())
                    || self.sysfs.kind(&dir.join(&entry)) == Some(EntryKind::File)
                {
                    continue;
                }
                self.delete_device(&handler, &entry)
                    .best_effort("deleting device");
            }
        }
    }

    /// Write handler-level attributes that differ.
    pub fn apply_handler_attributes(&self, handler: &str, attrs: &Attributes) {
        let dir = self.sysfs.handler(handler);
        if !self.sysfs.is_dir(&dir) {
            debug!(handler, "handler not loaded, skipping attributes");
            return;
        }
        let live = self.reader.values(&dir, attrs.keys().map(String::as_str));
        self.sync_attributes(&dir, attrs, &live);
    }
}

// Private
impl Writer<'_> {
    fn delete_device(&self, handler: &str, name: &str) -> Result<()> {
        let mgmt = self.sysfs.handler(handler).join(MGMT);
        self.sysfs.mgmt(&mgmt, "del_device", name)?;
        info!(device = name, handler, "deleted device");
        Ok(())
    }

    /// Handler with an entry for `name`, for devices with a broken link.
    fn find_handler(&self, name: &str) -> Option<String> {
        self.sysfs
            .list(&self.sysfs.handlers())
            .into_iter()
            .find(|h| self.sysfs.kind(&self.sysfs.handler(h).join(name)).is_some())
    }

    /// Current values of every attribute `dev` cares about.
    fn live_device(&self, dev: &Device) -> LiveAttributes {
        let dir = self.sysfs.device(&dev.name);
        let keys = dev
            .all_attributes()
            .map(|(k, _)| k.as_str())
            .chain(dev.handler.creation_keys());
        let non_default = self
            .reader
            .device(&dev.name)
            .map(|d| {
                d.all_attributes()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        LiveAttributes {
            values: self.reader.values(&dir, keys),
            non_default,
        }
    }
}
