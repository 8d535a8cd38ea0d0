//! Drivers, targets, LUNs and initiator groups.
use std::{collections::BTreeSet, path::Path};

use indexmap::IndexMap;
use tracing::debug;

use super::Reader;
use crate::{
    config::{Attributes, Driver, InitiatorGroup, Lun, Luns, Target},
    sysfs::{EntryKind, MgmtInfo},
    util::names::*,
};

/// Driver entries which are known not to be targets.
const DRIVER_ENTRIES: &[(&str, &[&str])] = &[
    (
        COPY_MANAGER,
        &["dif_capabilities", "allow_not_connected_copy"],
    ),
    (
        "iscsi",
        &[
            "link_local",
            "isns_entity_name",
            "internal_portal",
            "trace_level",
            "open_state",
            "version",
            "iSNSServer",
        ],
    ),
];

/// Driver files which are status, not configuration.
const DRIVER_STATUS: &[&str] = &[ENABLED, "type", "trace_level", "open_state", "version"];

/// Target entries which aren't plain attributes.
const TARGET_SPECIAL: &[&str] = &[ENABLED, HW_TARGET, "tid"];

/// Whether `name` is `base` followed by nothing or only digits.
fn is_variant(name: &str, base: &str) -> bool {
    name.strip_prefix(base)
        .map_or(false, |rest| rest.bytes().all(|b| b.is_ascii_digit()))
}

// Public
impl Reader<'_> {
    /// Every loaded driver and its targets.
    pub fn drivers(&self) -> IndexMap<String, Driver> {
        self.sysfs
            .list(&self.sysfs.targets())
            .into_iter()
            .filter(|name| self.sysfs.is_dir(&self.sysfs.driver(name)))
            .map(|name| {
                let driver = self.driver(&name);
                (name, driver)
            })
            .collect()
    }

    /// Driver `name` as it is now.
    pub fn driver(&self, name: &str) -> Driver {
        let info = self.driver_info(name);
        Driver {
            name: name.into(),
            attributes: self.driver_attributes(name, &info),
            targets: self
                .target_names(name)
                .into_iter()
                .map(|t| {
                    let target = self.target(name, &t, &info);
                    (t, target)
                })
                .collect(),
        }
    }

    /// Names of the real targets of driver `driver`.
    ///
    /// Known driver attribute entries are skipped, and a target is a
    /// directory with a LUN, initiator group or session subdirectory.
    pub fn target_names(&self, driver: &str) -> Vec<String> {
        let known = DRIVER_ENTRIES
            .iter()
            .find(|(d, _)| *d == driver)
            .map_or(&[][..], |(_, entries)| *entries);
        let dir = self.sysfs.driver(driver);
        self.sysfs
            .list(&dir)
            .into_iter()
            .filter(|e| e != MGMT && e != ENABLED && !known.contains(&e.as_str()))
            .filter(|e| {
                let path = dir.join(e);
                self.sysfs.kind(&path) == Some(EntryKind::Dir)
                    && [LUNS, INI_GROUPS, SESSIONS]
                        .iter()
                        .any(|sub| self.sysfs.is_dir(&path.join(sub)))
            })
            .collect()
    }

    /// Target `name` of driver `driver`, as it is now.
    pub fn target(&self, driver: &str, name: &str, info: &MgmtInfo) -> Target {
        let dir = self.sysfs.target(driver, name);
        let mut attributes = Attributes::new();
        for attr in &info.target_attributes {
            if let Some(value) = self.numbered_values(&dir, attr) {
                attributes.insert(attr.clone(), value);
            }
        }
        for entry in self.sysfs.list(&dir) {
            if entry == MGMT
                || TARGET_SPECIAL.contains(&entry.as_str())
                || info.target_attributes.iter().any(|a| is_variant(&entry, a))
            {
                continue;
            }
            if let Some(value) = self.non_default_file(&dir.join(&entry)) {
                attributes.insert(entry, value);
            }
        }
        if self.sysfs.read_attribute(&dir.join(ENABLED)).ok().as_deref() == Some("1") {
            attributes.insert(ENABLED.into(), "1".into());
        }

        let groups_dir = dir.join(INI_GROUPS);
        Target {
            name: name.into(),
            luns: self.luns(&dir.join(LUNS)),
            groups: self
                .subdirs(&groups_dir)
                .into_iter()
                .map(|g| {
                    let group = self.initiator_group(&groups_dir.join(&g), &g);
                    (g, group)
                })
                .collect(),
            attributes,
        }
    }

    /// Current values of `keys` on a target.
    ///
    /// Names in the driver's target attribute set are read with all their
    /// numbered variants, others as a plain first line.
    pub fn target_values<'k>(
        &self,
        driver: &str,
        target: &str,
        keys: impl IntoIterator<Item = &'k str>,
        info: &MgmtInfo,
    ) -> Attributes {
        let dir = self.sysfs.target(driver, target);
        let mut values = Attributes::new();
        for key in keys {
            let value = if info.target_attributes.contains(key) {
                self.numbered_values(&dir, key)
            } else {
                self.sysfs.read_attribute(&dir.join(key)).ok()
            };
            if let Some(value) = value {
                values.insert(key.into(), value);
            }
        }
        values
    }

    /// Values of a multi-valued target attribute, `;`-joined.
    ///
    /// The attribute is stored as `Attr`, `Attr1`, `Attr2`, ... and the
    /// first missing number ends the list.
    pub fn numbered_values(&self, dir: &Path, attr: &str) -> Option<String> {
        let mut values = Vec::new();
        let mut number = 0;
        loop {
            let name = if number == 0 {
                attr.to_owned()
            } else {
                format!("{attr}{number}")
            };
            let path = dir.join(&name);
            if !self.sysfs.exists(&path) {
                break;
            }
            match self.sysfs.read_attribute(&path) {
                Ok(v) if !v.is_empty() => values.push(v),
                Ok(_) => {}
                Err(e) => debug!(path = %path.display(), error = %e, "unreadable value"),
            }
            number += 1;
        }
        (!values.is_empty()).then(|| values.join(";"))
    }

    /// Values of a dynamic driver attribute, `;`-joined.
    ///
    /// Unlike target attributes, numbering may have gaps.
    pub fn driver_attribute_values(&self, driver: &str, attr: &str) -> Option<String> {
        let dir = self.sysfs.driver(driver);
        let mut names: Vec<String> = self
            .sysfs
            .list(&dir)
            .into_iter()
            .filter(|e| is_variant(e, attr))
            .collect();
        names.sort_by_key(|n| n[attr.len()..].parse::<u64>().unwrap_or(0));
        let values: Vec<String> = names
            .iter()
            .filter_map(|n| self.sysfs.read_attribute(&dir.join(n)).ok())
            .filter(|v| !v.is_empty())
            .collect();
        (!values.is_empty()).then(|| values.join(";"))
    }

    /// LUNs under the `luns` directory `dir`.
    pub fn luns(&self, dir: &Path) -> Luns {
        self.subdirs(dir)
            .into_iter()
            .map(|number| {
                let lun_dir = dir.join(&number);
                let lun = Lun {
                    device: self.sysfs.link_name(&lun_dir.join(DEVICE_LINK)),
                    attributes: self.non_default_attributes(&lun_dir, &[DEVICE_LINK]),
                };
                (number, lun)
            })
            .collect()
    }

    /// Names of the sessions of a target.
    pub fn sessions(&self, driver: &str, target: &str) -> BTreeSet<String> {
        let dir = self.sysfs.target(driver, target).join(SESSIONS);
        self.subdirs(&dir).into_iter().collect()
    }
}

// Private
impl Reader<'_> {
    /// Non-default static and all dynamic attributes of driver `driver`.
    fn driver_attributes(&self, driver: &str, info: &MgmtInfo) -> Attributes {
        let dir = self.sysfs.driver(driver);
        let mut attributes = Attributes::new();
        for attr in &info.driver_attributes {
            if let Some(value) = self.driver_attribute_values(driver, attr) {
                attributes.insert(attr.clone(), value);
            }
        }
        for entry in self.sysfs.list(&dir) {
            if entry == MGMT
                || DRIVER_STATUS.contains(&entry.as_str())
                || info.driver_attributes.iter().any(|a| is_variant(&entry, a))
            {
                continue;
            }
            if let Some(value) = self.non_default_file(&dir.join(&entry)) {
                attributes.insert(entry, value);
            }
        }
        if self.sysfs.read_attribute(&dir.join(ENABLED)).ok().as_deref() == Some("1") {
            attributes.insert(ENABLED.into(), "1".into());
        }
        attributes
    }

    fn initiator_group(&self, dir: &Path, name: &str) -> InitiatorGroup {
        InitiatorGroup {
            name: name.into(),
            initiators: self
                .sysfs
                .list(&dir.join(INITIATORS))
                .into_iter()
                .filter(|i| i != MGMT)
                .collect(),
            luns: self.luns(&dir.join(LUNS)),
            attributes: self.non_default_attributes(dir, &[]),
        }
    }
}
