//! Declarative configuration of the Linux SCST SCSI target subsystem.
//!
//! A configuration file describes devices, target drivers, targets, LUNs,
//! initiator groups and ALUA device groups. [`admin::ScstAdmin`] reads the
//! live state back from sysfs, diffs it against the file, and issues only the
//! management commands needed to converge.
//!
//! # Implementation details
//!
//! SCST is configured entirely through `/sys/kernel/scst_tgt`, so this
//! library requires it to exist, usually by loading the `scst` module.
//!
//! That interface is undocumented and changes between SCST releases.
//! This crate attempts to correctly document what it relies on, see
//! [`sysfs`]. This is done on a best effort basis.
#![doc(html_root_url = "https://docs.rs/scstadmin/0.1.0")]

pub mod admin;
pub mod config;
pub mod error;
pub mod modules;
pub mod reader;
pub mod sysfs;
pub mod writer;

mod util;
