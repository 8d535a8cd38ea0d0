//! ALUA device groups and their target groups.
use std::path::Path;

use indexmap::IndexMap;

use super::Reader;
use crate::{
    config::{Attributes, DeviceGroup, TargetGroup},
    sysfs::EntryKind,
    util::{names::*, DEFAULT_SENTINEL},
};

/// Target group entries which are members, not attributes.
fn is_member(kind: Option<EntryKind>) -> bool {
    matches!(kind, Some(EntryKind::Dir | EntryKind::Symlink))
}

// Public
impl Reader<'_> {
    pub fn device_groups(&self) -> IndexMap<String, DeviceGroup> {
        self.subdirs(&self.sysfs.device_groups())
            .into_iter()
            .map(|name| {
                let dg = self.device_group(&name);
                (name, dg)
            })
            .collect()
    }

    pub fn device_group(&self, name: &str) -> DeviceGroup {
        let dir = self.sysfs.device_group(name);
        let tgs = dir.join(TARGET_GROUPS);
        DeviceGroup {
            name: name.into(),
            devices: self.members(&dir.join(DEVICES)),
            target_groups: self
                .subdirs(&tgs)
                .into_iter()
                .map(|tg| {
                    let group = self.target_group(&tgs.join(&tg), &tg);
                    (tg, group)
                })
                .collect(),
            attributes: self.non_default_attributes(&dir, &[]),
        }
    }

    /// Device or target names in membership directory `dir`.
    pub fn members(&self, dir: &Path) -> Vec<String> {
        self.sysfs
            .list(dir)
            .into_iter()
            .filter(|e| e != MGMT && is_member(self.sysfs.kind(&dir.join(e))))
            .collect()
    }

    /// Target group at `dir`.
    ///
    /// Only targets which are directories can carry attributes, symlinked
    /// ones are plain members.
    pub fn target_group(&self, dir: &Path, name: &str) -> TargetGroup {
        let mut tg = TargetGroup {
            name: name.into(),
            ..TargetGroup::default()
        };
        for entry in self.sysfs.list(dir) {
            if entry == MGMT {
                continue;
            }
            let path = dir.join(&entry);
            match self.sysfs.kind(&path) {
                Some(EntryKind::Dir) => {
                    let attrs = self.target_group_member(&path);
                    if !attrs.is_empty() {
                        tg.target_attributes.insert(entry.clone(), attrs);
                    }
                    tg.targets.push(entry);
                }
                Some(EntryKind::Symlink) => tg.targets.push(entry),
                Some(EntryKind::File) => {
                    if let Some(value) = self.non_default_file(&path) {
                        tg.attributes.insert(entry, value);
                    }
                }
                None => {}
            }
        }
        tg
    }
}

// Private
impl Reader<'_> {
    /// Attributes of a directory target group member.
    ///
    /// `rel_tgt_id` has no meaningful default, so every set value counts.
    fn target_group_member(&self, dir: &Path) -> Attributes {
        self.sysfs
            .list(dir)
            .into_iter()
            .filter(|e| self.sysfs.kind(&dir.join(e)) == Some(EntryKind::File))
            .filter_map(|e| {
                let value = self.sysfs.read_attribute(&dir.join(&e)).ok()?;
                (!value.is_empty() && value != DEFAULT_SENTINEL).then_some((e, value))
            })
            .collect()
    }
}
