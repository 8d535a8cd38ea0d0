//! The SCST configuration model.
//!
//! A [`Configuration`] describes desired state parsed from text, or observed
//! state read back from the control plane by [`crate::reader`]. Both have the
//! same shape so they can be compared entity by entity.
//!
//! Names are identity. Every map is keyed by the entity's name, or the LUN
//! number for LUNs, and no other IDs exist.
use indexmap::IndexMap;
use tracing::debug;

pub use self::handler::HandlerKind;
use crate::error::ConfigError;

mod handler;
pub mod parser;
mod serialize;

/// Attribute name to value.
///
/// Multi-valued attributes, like several `IncomingUser` credentials, are
/// joined with `;`.
pub type Attributes = IndexMap<String, String>;

/// A SCST device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub handler: HandlerKind,

    /// Only settable through `add_device`.
    pub creation_attributes: Attributes,

    /// Settable on a live device.
    pub attributes: Attributes,
}

impl Device {
    /// Create a device from flat config attributes, sorting them into
    /// creation and post-creation attributes by `handler`.
    ///
    /// # Errors
    ///
    /// - If `handler` is not a [`HandlerKind`]
    pub fn new(name: &str, handler: &str, attrs: Attributes) -> Result<Self, ConfigError> {
        let handler = HandlerKind::from_name(handler).ok_or_else(|| ConfigError::UnknownHandler {
            handler: handler.into(),
            device: name.into(),
        })?;
        let mut dev = Self {
            name: name.into(),
            handler,
            creation_attributes: Attributes::new(),
            attributes: Attributes::new(),
        };
        for (key, value) in attrs {
            if handler.ignores(&key) {
                debug!(device = name, %handler, key = %key, "ignoring attribute");
                continue;
            }
            let key = HandlerKind::canonical(&key).to_owned();
            if handler.is_creation_key(&key) {
                dev.creation_attributes.insert(key, value);
            } else {
                dev.attributes.insert(key, value);
            }
        }
        Ok(dev)
    }

    /// Argument for `add_device`.
    ///
    /// `NAME k=v;k=v;`, `cluster_mode` last, or just `NAME`.
    pub fn add_argument(&self) -> String {
        let mut params: Vec<_> = self
            .creation_attributes
            .iter()
            .filter(|(k, _)| *k != "cluster_mode")
            .collect();
        if let Some(cm) = self.creation_attributes.get_key_value("cluster_mode") {
            params.push(cm);
        }
        if params.is_empty() {
            return self.name.clone();
        }
        let params: String = params.iter().map(|(k, v)| format!("{k}={v};")).collect();
        format!("{} {params}", self.name)
    }

    /// Creation and post-creation attributes together.
    pub fn all_attributes(&self) -> impl Iterator<Item = (&String, &String)> {
        self.creation_attributes.iter().chain(&self.attributes)
    }
}

/// A device exported as a LUN, by a target or initiator group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lun {
    /// Device name. A LUN without one only carries attributes.
    pub device: Option<String>,
    pub attributes: Attributes,
}

impl Lun {
    pub fn new(device: &str) -> Self {
        Self {
            device: Some(device.into()),
            attributes: Attributes::new(),
        }
    }
}

/// LUN number to assignment.
///
/// LUN numbers are kept as strings, exactly as written.
pub type Luns = IndexMap<String, Lun>;

/// Initiators which see their own set of LUNs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitiatorGroup {
    pub name: String,
    pub initiators: Vec<String>,
    pub luns: Luns,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub luns: Luns,
    pub groups: IndexMap<String, InitiatorGroup>,
    pub attributes: Attributes,
}

/// A target driver, such as `iscsi` or `qla2x00t`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Driver {
    pub name: String,
    pub targets: IndexMap<String, Target>,
    pub attributes: Attributes,
}

/// ALUA target group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetGroup {
    pub name: String,
    pub targets: Vec<String>,

    /// Per-target attributes such as `rel_tgt_id`.
    ///
    /// A target with attributes is a directory in the control plane, one
    /// without is a symlink.
    pub target_attributes: IndexMap<String, Attributes>,

    /// `group_id`, `state`, ...
    pub attributes: Attributes,
}

/// ALUA device group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceGroup {
    pub name: String,
    pub devices: Vec<String>,
    pub target_groups: IndexMap<String, TargetGroup>,
    pub attributes: Attributes,
}

/// A complete SCST configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    /// Handler name to handler-level attributes.
    pub handlers: IndexMap<String, Attributes>,
    pub devices: IndexMap<String, Device>,
    pub drivers: IndexMap<String, Driver>,
    pub device_groups: IndexMap<String, DeviceGroup>,

    /// Attributes of the SCST core itself, such as `threads`.
    pub attributes: Attributes,
}

impl Configuration {
    /// Handler of every device, plus handlers mentioned without devices.
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        for dev in self.devices.values() {
            let name = dev.handler.name();
            if !names.iter().any(|n| n == name) {
                names.push(name.into());
            }
        }
        names
    }

    /// Devices belonging to handler `kind`.
    pub fn devices_of(&self, kind: HandlerKind) -> impl Iterator<Item = &Device> {
        self.devices.values().filter(move |d| d.handler == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn device_sorts_attributes() {
        let dev = Device::new(
            "d1",
            "vdisk_blockio",
            attrs(&[
                ("cluster_mode", "1"),
                ("filename", "/dev/zvol/tank/d1"),
                ("readonly", "1"),
                ("threads_num", "32"),
            ]),
        )
        .unwrap();
        assert_eq!(dev.handler, HandlerKind::VdiskBlockio);
        assert_eq!(
            dev.creation_attributes,
            attrs(&[
                ("cluster_mode", "1"),
                ("filename", "/dev/zvol/tank/d1"),
                ("read_only", "1"),
            ])
        );
        assert_eq!(dev.attributes, attrs(&[("threads_num", "32")]));
        assert_eq!(
            dev.add_argument(),
            "d1 filename=/dev/zvol/tank/d1;read_only=1;cluster_mode=1;"
        );
    }

    #[test]
    fn passthrough_device() {
        let dev = Device::new(
            "17:0:0:1",
            "dev_disk",
            attrs(&[("filename", "/dev/sdb"), ("cluster_mode", "1")]),
        )
        .unwrap();
        assert!(dev.creation_attributes.is_empty());
        assert_eq!(dev.attributes, attrs(&[("cluster_mode", "1")]));
        assert_eq!(dev.add_argument(), "17:0:0:1");
    }

    #[test]
    fn unknown_handler() {
        let err = Device::new("d1", "vdisk_magic", Attributes::new()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownHandler { ref handler, .. } if handler == "vdisk_magic"));
    }

    #[test]
    fn handler_names_include_device_handlers() {
        let mut cfg = Configuration::default();
        cfg.handlers.insert("dev_user".into(), Attributes::new());
        let dev = Device::new("d1", "vdisk_fileio", Attributes::new()).unwrap();
        cfg.devices.insert("d1".into(), dev);
        assert_eq!(cfg.handler_names(), ["dev_user", "vdisk_fileio"]);
    }
}
