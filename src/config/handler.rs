//! Device handlers SCST can create devices with.
use std::fmt;

/// Creation parameters shared by the `vdisk_*` handlers.
const VDISK_COMMON: &[&str] = &[
    "active",
    "blocksize",
    "cluster_mode",
    "dif_mode",
    "dif_static_app_tag",
    "dif_type",
    "numa_node_id",
    "read_only",
    "removable",
    "rotational",
    "tst",
    "t10_dev_id",
];

const FILEIO_CREATE: &[&str] = &[
    "async",
    "dif_filename",
    "filename",
    "nv_cache",
    "o_direct",
    "thin_provisioned",
    "write_through",
];

const BLOCKIO_CREATE: &[&str] = &[
    "bind_alua_state",
    "dif_filename",
    "filename",
    "nv_cache",
    "thin_provisioned",
    "write_through",
];

const NULLIO_CREATE: &[&str] = &["dummy", "size", "size_mb"];

/// Settable attributes every virtual disk has after creation.
const VDISK_SETTABLE: &[&str] = &[
    "eui64_id",
    "expl_alua",
    "inq_vend_specific",
    "lb_per_pb_exp",
    "naa_id",
    "prod_id",
    "prod_rev_lvl",
    "size",
    "size_mb",
    "threads_num",
    "threads_pool_type",
    "t10_vend_id",
    "usn",
    "vend_specific_id",
    "write_same_max_bytes",
];

/// Settable attributes of pass-through devices.
const PASSTHROUGH_SETTABLE: &[&str] = &[
    "cluster_mode",
    "read_only",
    "rotational",
    "threads_num",
    "threads_pool_type",
    "thin_provisioned",
];

/// Config spellings which SCST knows under another name.
const ALIASES: &[(&str, &str)] = &[("readonly", "read_only")];

/// Kind of a SCST device handler.
///
/// This is a closed set, devices of any other handler can't be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HandlerKind {
    VdiskFileio,
    VdiskBlockio,
    VdiskNullio,
    Vcdrom,
    DevDisk,
    DevDiskPerf,
    DevCdrom,
    DevChanger,
    DevModisk,
    DevModiskPerf,
    DevProcessor,
    DevRaid,
    DevTape,
    DevTapePerf,
}

impl HandlerKind {
    pub const ALL: [Self; 14] = [
        Self::VdiskFileio,
        Self::VdiskBlockio,
        Self::VdiskNullio,
        Self::Vcdrom,
        Self::DevDisk,
        Self::DevDiskPerf,
        Self::DevCdrom,
        Self::DevChanger,
        Self::DevModisk,
        Self::DevModiskPerf,
        Self::DevProcessor,
        Self::DevRaid,
        Self::DevTape,
        Self::DevTapePerf,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Handler directory name under `handlers/`.
    pub fn name(self) -> &'static str {
        match self {
            Self::VdiskFileio => "vdisk_fileio",
            Self::VdiskBlockio => "vdisk_blockio",
            Self::VdiskNullio => "vdisk_nullio",
            Self::Vcdrom => "vcdrom",
            Self::DevDisk => "dev_disk",
            Self::DevDiskPerf => "dev_disk_perf",
            Self::DevCdrom => "dev_cdrom",
            Self::DevChanger => "dev_changer",
            Self::DevModisk => "dev_modisk",
            Self::DevModiskPerf => "dev_modisk_perf",
            Self::DevProcessor => "dev_processor",
            Self::DevRaid => "dev_raid",
            Self::DevTape => "dev_tape",
            Self::DevTapePerf => "dev_tape_perf",
        }
    }

    /// Pass-through handlers export an existing SCSI device, named `H:C:I:L`.
    pub fn is_passthrough(self) -> bool {
        self.name().starts_with("dev_")
    }

    /// Parameters only accepted by `add_device`.
    ///
    /// Changing any of these requires deleting and re-adding the device.
    pub fn creation_keys(self) -> Vec<&'static str> {
        let extra: &[&str] = match self {
            Self::VdiskFileio => FILEIO_CREATE,
            Self::VdiskBlockio => BLOCKIO_CREATE,
            Self::VdiskNullio => NULLIO_CREATE,
            Self::Vcdrom => return vec!["tst"],
            _ => return Vec::new(),
        };
        let mut keys: Vec<_> = VDISK_COMMON.iter().chain(extra).copied().collect();
        keys.sort_unstable();
        keys
    }

    pub fn is_creation_key(self, key: &str) -> bool {
        self.creation_keys().contains(&key)
    }

    /// Every attribute name this handler is known to accept.
    pub fn known_attributes(self) -> Vec<&'static str> {
        let mut keys = self.creation_keys();
        if self.is_passthrough() {
            keys.extend(PASSTHROUGH_SETTABLE);
        } else {
            keys.extend(VDISK_SETTABLE);
            keys.push("filename");
        }
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    /// Config keys which are dropped, pass-through devices have no backing
    /// file.
    pub(crate) fn ignores(self, key: &str) -> bool {
        self.is_passthrough() && key == "filename"
    }

    /// SCST spelling of config key `key`.
    pub(crate) fn canonical(key: &str) -> &str {
        ALIASES
            .iter()
            .find(|(alias, _)| *alias == key)
            .map_or(key, |(_, real)| real)
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
