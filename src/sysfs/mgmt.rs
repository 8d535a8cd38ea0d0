//! The `mgmt` help text mini-protocol.
//!
//! Reading a `mgmt` file returns usage text. Three fixed label lines in it
//! tell which names are valid creation parameters, driver attributes and
//! target attributes:
//!
//! ```text
//! The following parameters available: node_name, parent_host.
//! The following target driver attributes available: IncomingUser, OutgoingUser
//! The following target attributes available: IncomingUser, OutgoingUser, allowed_portal
//! ```
//!
//! These labels are the only contract, everything else in the text is
//! ignored.
use std::collections::BTreeSet;

/// Label for parameters accepted by `add_target`, `add_device` or LUN `add`.
pub const CREATE_PARAMS_LABEL: &str = "The following parameters available:";

/// Label for attributes managed by `add_attribute` / `del_attribute`.
pub const DRIVER_ATTRS_LABEL: &str = "The following target driver attributes available:";

/// Label for attributes managed by `add_target_attribute` /
/// `del_target_attribute`.
pub const TARGET_ATTRS_LABEL: &str = "The following target attributes available:";

/// Name sets parsed from a `mgmt` help text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MgmtInfo {
    pub create_params: BTreeSet<String>,
    pub driver_attributes: BTreeSet<String>,
    pub target_attributes: BTreeSet<String>,
}

impl MgmtInfo {
    pub fn parse(help: &str) -> Self {
        let mut info = Self::default();
        for line in help.lines() {
            let set = if line.contains(CREATE_PARAMS_LABEL) {
                &mut info.create_params
            } else if line.contains(DRIVER_ATTRS_LABEL) {
                &mut info.driver_attributes
            } else if line.contains(TARGET_ATTRS_LABEL) {
                &mut info.target_attributes
            } else {
                continue;
            };
            set.extend(parse_names(line));
        }
        info
    }

    /// Whether the text listed nothing at all.
    pub fn is_empty(&self) -> bool {
        self.create_params.is_empty()
            && self.driver_attributes.is_empty()
            && self.target_attributes.is_empty()
    }
}

/// `Label: a, b, c.` to `{a, b, c}`
fn parse_names(line: &str) -> impl Iterator<Item = String> + '_ {
    let list = line.split_once(':').map_or("", |(_, rest)| rest);
    list.trim()
        .trim_end_matches('.')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}
