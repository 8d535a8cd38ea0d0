//! Converging the live control plane on a desired [`Configuration`].
//!
//! Every entity goes through the same three-way decision, see [`decide`].
//! Membership of groups is synchronized by set difference, see
//! [`membership`], and never by recreating the container.
//!
//! The writers are split by entity: [`device`](self::device) for devices,
//! [`target`](self::target) for drivers, targets, LUNs and initiator groups,
//! and [`group`](self::group) for ALUA device and target groups. They are
//! sequenced by [`crate::admin::ScstAdmin`].
//!
//! [`Configuration`]: crate::config::Configuration
use std::{path::Path, time::Duration};

use tracing::debug;

pub use self::target::{RemovalReport, SessionClose};
use crate::{
    config::Attributes,
    error::BestEffort,
    reader::Reader,
    sysfs::Sysfs,
    util::{split_values, DEFAULT_SENTINEL},
};

mod device;
mod group;
mod target;

/// Default for how long removal waits on force-closed sessions.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default delay between session checks.
pub const DEFAULT_SESSION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What to do with an existing entity.
///
/// Ordered by severity, so the stronger of two decisions is their `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Action {
    /// Live state already matches.
    Skip,

    /// Rewrite post-creation attributes in place.
    Update,

    /// Delete and create again.
    Recreate,
}

/// Live attribute state of one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveAttributes {
    /// Current values of the keys being compared.
    pub values: Attributes,

    /// Values currently marked non-default.
    pub non_default: Attributes,
}

/// Decide what to do with an existing entity.
///
/// - [`Action::Recreate`] if a creation key is non-default live but absent
///   from `creation`, since creation attributes can't be unset in place.
/// - [`Action::Recreate`] if any creation attribute differs.
/// - [`Action::Update`] if any post-creation attribute differs.
/// - [`Action::Skip`] otherwise.
///
/// See [`differs`] for what counts as different.
pub fn decide(
    creation: &Attributes,
    post: &Attributes,
    live: &LiveAttributes,
    creation_keys: &[&str],
) -> Action {
    let unset = creation_keys
        .iter()
        .any(|k| live.non_default.contains_key(*k) && !creation.contains_key(*k));
    if unset || any_differs(creation, &live.values) {
        Action::Recreate
    } else if any_differs(post, &live.values) {
        Action::Update
    } else {
        Action::Skip
    }
}

/// Whether `desired` differs from the `live` value.
///
/// Multi-valued attributes compare as sets. A missing live value matches
/// the default sentinel `0`.
pub fn differs(desired: &str, live: Option<&String>) -> bool {
    match live {
        Some(live) => {
            let mut want: Vec<_> = split_values(desired).collect();
            let mut have: Vec<_> = split_values(live).collect();
            want.sort_unstable();
            have.sort_unstable();
            want != have
        }
        None => desired != DEFAULT_SENTINEL,
    }
}

fn any_differs(desired: &Attributes, live: &Attributes) -> bool {
    desired.iter().any(|(k, v)| differs(v, live.get(k)))
}

/// Set difference between `current` and `desired` members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership<'a> {
    /// In `desired` order.
    pub add: Vec<&'a str>,

    /// In `current` order.
    pub remove: Vec<&'a str>,
}

pub fn membership<'a>(current: &'a [String], desired: &'a [String]) -> Membership<'a> {
    Membership {
        add: desired
            .iter()
            .filter(|d| !current.contains(d))
            .map(String::as_str)
            .collect(),
        remove: current
            .iter()
            .filter(|c| !desired.contains(c))
            .map(String::as_str)
            .collect(),
    }
}

/// Applies desired state, entity by entity.
#[derive(Debug)]
pub struct Writer<'a> {
    reader: &'a Reader<'a>,
    sysfs: &'a Sysfs,
    session_timeout: Duration,
    session_poll_interval: Duration,
}

// Public
impl<'a> Writer<'a> {
    pub fn new(reader: &'a Reader<'a>) -> Self {
        Self {
            reader,
            sysfs: reader.sysfs(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            session_poll_interval: DEFAULT_SESSION_POLL_INTERVAL,
        }
    }

    /// Set how long target removal waits for sessions to close.
    pub fn with_session_timeout(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.session_timeout = timeout;
        self.session_poll_interval = poll_interval;
        self
    }

    /// Write each attribute of `desired` under `dir` that differs from
    /// `live`.
    ///
    /// Failures are logged and skipped. Returns how many were written.
    pub fn sync_attributes(&self, dir: &Path, desired: &Attributes, live: &Attributes) -> usize {
        let mut written = 0;
        for (key, value) in desired {
            if !differs(value, live.get(key)) {
                continue;
            }
            let path = dir.join(key);
            debug!(path = %path.display(), value = %value, "updating attribute");
            if self
                .sysfs
                .write(&path, value, false)
                .best_effort("setting attribute")
                .is_some()
            {
                written += 1;
            }
        }
        written
    }
}
