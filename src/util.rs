//! Utility constants and helpers

/// Technically Linux requires sysfs to be at `/sys`, calling it a system
/// configuration error otherwise.
///
/// Kept as a constant so it can be changed, and overridden in
/// [`crate::admin::Settings`] for testing.
pub const SYSFS_PATH: &str = "/sys";

/// Root of the SCST control plane. Same reasons as [`SYSFS_PATH`].
pub const SCST_ROOT: &str = "/sys/kernel/scst_tgt";

/// Kernel Module location. Same reasons as [`SYSFS_PATH`].
pub const MODULE_PATH: &str = "/lib/modules";

/// Control-plane subdirectories and special files.
pub(crate) mod names {
    pub const HANDLERS: &str = "handlers";
    pub const DEVICES: &str = "devices";
    pub const TARGETS: &str = "targets";
    pub const DEVICE_GROUPS: &str = "device_groups";

    pub const MGMT: &str = "mgmt";
    pub const ENABLED: &str = "enabled";
    pub const RESULT: &str = "last_sysfs_mgmt_res";
    pub const SUSPEND: &str = "suspend";

    pub const LUNS: &str = "luns";
    pub const INI_GROUPS: &str = "ini_groups";
    pub const INITIATORS: &str = "initiators";
    pub const SESSIONS: &str = "sessions";
    pub const FORCE_CLOSE: &str = "force_close";
    pub const HW_TARGET: &str = "hw_target";
    pub const TARGET_GROUPS: &str = "target_groups";

    /// Link from a device or LUN back to its owner.
    pub const HANDLER_LINK: &str = "handler";
    pub const DEVICE_LINK: &str = "device";

    pub const COPY_MANAGER: &str = "copy_manager";
    pub const COPY_MANAGER_TGT: &str = "copy_manager_tgt";
}

/// Value the control plane uses as the compiled-in default for most
/// boolean and numeric attributes.
pub const DEFAULT_SENTINEL: &str = "0";

/// Marker appended on its own line to attributes that differ from their
/// default.
pub const KEY_MARKER: &str = "[key]";

/// Strip surrounding matching quotes, `'` or `"`.
pub(crate) fn unquote(s: &str) -> &str {
    let b = s.as_bytes();
    if b.len() >= 2 && (b[0] == b'"' || b[0] == b'\'') && b[b.len() - 1] == b[0] {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// Initiator names may be escaped in config files, `\#` for `#`.
pub(crate) fn normalize_initiator(s: &str) -> String {
    s.replace('\\', "")
}

/// Split a possibly `;`-joined multi-value string.
pub(crate) fn split_values(s: &str) -> impl Iterator<Item = &str> {
    s.split(';').map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unquote_only_matching() {
        assert_eq!(unquote("\"a b\""), "a b");
        assert_eq!(unquote("'x'"), "x");
        assert_eq!(unquote("\"x'"), "\"x'");
        assert_eq!(unquote("\""), "\"");
        assert_eq!(unquote("plain"), "plain");
    }

    #[test]
    fn initiators_lose_escapes() {
        assert_eq!(normalize_initiator(r"iqn.1994-05.com.redhat:\#1"), "iqn.1994-05.com.redhat:#1");
        assert_eq!(normalize_initiator(r"\*"), "*");
    }

    #[test]
    fn values_split() {
        let v: Vec<_> = split_values("a b;c d; ;").collect();
        assert_eq!(v, ["a b", "c d"]);
    }
}
