//! Reading the live control plane back into a [`Configuration`].
//!
//! The observed model records only what differs from the kernel defaults,
//! values carrying a `[key]` marker, so it has the same shape as a
//! configuration file describing the system. Comparisons against desired
//! values use [`Reader::values`], which reads the plain first line.
//!
//! Each driver's `mgmt` help text is parsed once per [`Reader`] and cached.
use std::{
    cell::RefCell,
    collections::HashMap,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::{
    config::{Attributes, Configuration, Device},
    error::{Error, Result},
    sysfs::{EntryKind, MgmtInfo, Sysfs},
    util::names::*,
};

mod group;
mod target;

/// Handler entries which are never devices or attributes.
const HANDLER_SPECIAL: &[&str] = &[MGMT, "type"];

/// Device entries which aren't attributes.
const DEVICE_SPECIAL: &[&str] = &[HANDLER_LINK, "exported", "type", "scsi_device"];

/// Core entries which aren't attributes.
const ROOT_SPECIAL: &[&str] = &[
    HANDLERS,
    DEVICES,
    TARGETS,
    DEVICE_GROUPS,
    RESULT,
    SUSPEND,
    "sgv",
    "version",
];

/// Reads the live control plane, see the module docs.
#[derive(Debug)]
pub struct Reader<'a> {
    sysfs: &'a Sysfs,
    mgmt_cache: RefCell<HashMap<PathBuf, MgmtInfo>>,
}

// Public
impl<'a> Reader<'a> {
    pub fn new(sysfs: &'a Sysfs) -> Self {
        Self {
            sysfs,
            mgmt_cache: RefCell::default(),
        }
    }

    pub fn sysfs(&self) -> &'a Sysfs {
        self.sysfs
    }

    /// Read the whole observed configuration.
    ///
    /// # Errors
    ///
    /// - If the control plane does not exist
    pub fn read_configuration(&self) -> Result<Configuration> {
        if !self.sysfs.available() {
            return Err(Error::Unavailable(self.sysfs.root().into()));
        }
        Ok(Configuration {
            handlers: self.handlers(),
            devices: self.devices(),
            drivers: self.drivers(),
            device_groups: self.device_groups(),
            attributes: self.global_attributes(),
        })
    }

    /// Non-default attributes of SCST itself.
    pub fn global_attributes(&self) -> Attributes {
        let root = self.sysfs.root();
        self.sysfs
            .list(root)
            .into_iter()
            .filter(|name| !ROOT_SPECIAL.contains(&name.as_str()))
            .filter_map(|name| {
                let path = root.join(&name);
                self.non_default_file(&path).map(|v| (name, v))
            })
            .collect()
    }

    /// Non-default attributes of every handler which has any.
    pub fn handlers(&self) -> IndexMap<String, Attributes> {
        let mut handlers = IndexMap::new();
        for name in self.sysfs.list(&self.sysfs.handlers()) {
            let dir = self.sysfs.handler(&name);
            let attrs: Attributes = self
                .sysfs
                .list(&dir)
                .into_iter()
                .filter(|e| !HANDLER_SPECIAL.contains(&e.as_str()))
                .filter_map(|e| self.non_default_file(&dir.join(&e)).map(|v| (e, v)))
                .collect();
            if !attrs.is_empty() {
                handlers.insert(name, attrs);
            }
        }
        handlers
    }

    /// Every device whose handler is known.
    pub fn devices(&self) -> IndexMap<String, Device> {
        self.sysfs
            .list(&self.sysfs.devices())
            .into_iter()
            .filter_map(|name| self.device(&name).map(|d| (name, d)))
            .collect()
    }

    /// Device `name`, if it exists and has a known handler.
    pub fn device(&self, name: &str) -> Option<Device> {
        let handler = self.device_handler(name)?;
        let dir = self.sysfs.device(name);
        let attrs: Attributes = self
            .sysfs
            .list(&dir)
            .into_iter()
            .filter(|e| !DEVICE_SPECIAL.contains(&e.as_str()))
            .filter_map(|e| self.non_default_file(&dir.join(&e)).map(|v| (e, v)))
            .collect();
        match Device::new(name, &handler, attrs) {
            Ok(dev) => Some(dev),
            Err(e) => {
                debug!(device = name, error = %e, "skipping device");
                None
            }
        }
    }

    /// Handler name of device `name`, from its `handler` link.
    pub fn device_handler(&self, name: &str) -> Option<String> {
        self.sysfs
            .link_name(&self.sysfs.device(name).join(HANDLER_LINK))
    }

    /// First-line values of `keys` under `dir`, skipping unreadable ones.
    pub fn values<'k>(&self, dir: &Path, keys: impl IntoIterator<Item = &'k str>) -> Attributes {
        keys.into_iter()
            .filter_map(|key| {
                let value = self.sysfs.read_attribute(&dir.join(key)).ok()?;
                Some((key.to_owned(), value))
            })
            .collect()
    }

    /// Parsed help text of the `mgmt` file at `path`, cached.
    ///
    /// An unreadable file gives empty name sets.
    pub fn mgmt_info(&self, path: &Path) -> MgmtInfo {
        if let Some(info) = self.mgmt_cache.borrow().get(path) {
            return info.clone();
        }
        let info = match self.sysfs.read(path) {
            Ok(help) => MgmtInfo::parse(&help),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no mgmt help");
                MgmtInfo::default()
            }
        };
        self.mgmt_cache
            .borrow_mut()
            .insert(path.into(), info.clone());
        info
    }

    /// Help text of driver `driver`.
    pub fn driver_info(&self, driver: &str) -> MgmtInfo {
        self.mgmt_info(&self.sysfs.driver(driver).join(MGMT))
    }

    /// Forget cached help texts, drivers may have been loaded since.
    pub fn invalidate(&self) {
        self.mgmt_cache.borrow_mut().clear();
    }
}

// Private
impl Reader<'_> {
    /// Value of the regular file `path`, if marked non-default.
    fn non_default_file(&self, path: &Path) -> Option<String> {
        if self.sysfs.kind(path) != Some(EntryKind::File) {
            return None;
        }
        match self.sysfs.read_if_non_default(path) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable attribute");
                None
            }
        }
    }

    /// Non-default regular files directly in `dir`, except `skip`.
    fn non_default_attributes(&self, dir: &Path, skip: &[&str]) -> Attributes {
        self.sysfs
            .list(dir)
            .into_iter()
            .filter(|e| e != MGMT && !skip.contains(&e.as_str()))
            .filter_map(|e| self.non_default_file(&dir.join(&e)).map(|v| (e, v)))
            .collect()
    }

    /// Subdirectories of `dir`.
    pub(crate) fn subdirs(&self, dir: &Path) -> Vec<String> {
        self.sysfs
            .list(dir)
            .into_iter()
            .filter(|e| self.sysfs.kind(&dir.join(e)) == Some(EntryKind::Dir))
            .collect()
    }
}
