//! A simulated SCST kernel.
//!
//! [`FakeScst`] interprets management commands the way the kernel does,
//! renders `[key]` markers on attributes that differ from their default,
//! exports every new device on the copy manager target, and journals every
//! successful write in order.
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use scstadmin::{
    admin::{ScstAdmin, Settings},
    config::{parser, Configuration},
    modules::{self, ModuleLoader},
    sysfs::{ControlFs, EntryKind, MemFs},
};

pub const ROOT: &str = "/scst";

pub const ISCSI_HELP: &str = "\
Usage: echo \"add_target target_name [parameters]\" >mgmt
       echo \"del_target target_name\" >mgmt
       echo \"add_attribute <attribute> <value>\" >mgmt
       echo \"del_attribute <attribute> <value>\" >mgmt
       echo \"add_target_attribute target_name <attribute> <value>\" >mgmt
       echo \"del_target_attribute target_name <attribute> <value>\" >mgmt

The following target driver attributes available: IncomingUser, OutgoingUser
The following target attributes available: IncomingUser, OutgoingUser, allowed_portal
";

pub const LUN_HELP: &str = "\
Usage: echo \"add H:C:I:L lun [parameters]\" >mgmt
       echo \"del lun\" >mgmt
       echo \"clear\" >mgmt

The following parameters available: read_only.
";

const HANDLERS: &[&str] = &["vdisk_fileio", "vdisk_blockio", "vdisk_nullio", "dev_disk"];

/// Attribute files of a new device, with their defaults.
const DEVICE_FILES: &[(&str, &str)] = &[
    ("blocksize", "512"),
    ("filename", ""),
    ("nv_cache", "0"),
    ("prod_id", ""),
    ("read_only", "0"),
    ("rotational", "1"),
    ("t10_dev_id", ""),
    ("threads_num", "1"),
];

const TARGET_FILES: &[(&str, &str)] = &[("QueuedCommands", "32"), ("rel_tgt_id", "0")];

fn invalid(what: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, what.into())
}

fn render(default: Option<&str>, value: &str) -> String {
    let value = value.trim();
    if default == Some(value) {
        format!("{value}\n")
    } else {
        format!("{value}\n[key]\n")
    }
}

fn is_variant(name: &str, base: &str) -> bool {
    name.strip_prefix(base)
        .map_or(false, |rest| rest.bytes().all(|b| b.is_ascii_digit()))
}

/// `k=v;k=v;` into pairs.
fn params(text: &str) -> Vec<(String, String)> {
    text.split(';')
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        .collect()
}

#[derive(Debug)]
pub struct FakeScst {
    fs: MemFs,
    root: PathBuf,
    defaults: Mutex<HashMap<PathBuf, String>>,
    stuck: Mutex<HashSet<PathBuf>>,
}

// Public
impl FakeScst {
    /// Core, the common handlers, `iscsi` and the copy manager.
    pub fn new() -> Arc<Self> {
        let fake = Self {
            fs: MemFs::new(),
            root: ROOT.into(),
            defaults: Mutex::default(),
            stuck: Mutex::default(),
        };
        fake.fs.add_file(fake.path("last_sysfs_mgmt_res"), "0\n", false);
        fake.fs.add_file(fake.path("suspend"), "0\n", true);
        fake.fs.add_file(fake.path("version"), "3.7.0\n", false);
        fake.attribute("threads", "8");
        fake.fs.add_dir(fake.path("devices"));
        for h in HANDLERS {
            fake.fs.add_file(fake.path(&format!("handlers/{h}/mgmt")), "", true);
            fake.attribute(&format!("handlers/{h}/trace_level"), "0");
        }

        fake.add_driver("iscsi", ISCSI_HELP);
        fake.attribute("targets/iscsi/link_local", "1");
        fake.attribute("targets/iscsi/iSNSServer", "");
        fake.fs
            .add_file(fake.path("targets/iscsi/version"), "3.7.0\n", false);

        fake.fs
            .add_file(fake.path("targets/copy_manager/mgmt"), "", true);
        fake.fs.add_file(
            fake.path("targets/copy_manager/copy_manager_tgt/luns/mgmt"),
            LUN_HELP,
            true,
        );

        fake.fs.add_file(fake.path("device_groups/mgmt"), "", true);
        Arc::new(fake)
    }

    /// Add a loaded target driver.
    pub fn add_driver(&self, name: &str, help: &str) {
        self.fs
            .add_file(self.path(&format!("targets/{name}/mgmt")), help, true);
        self.fs
            .add_file(self.path(&format!("targets/{name}/enabled")), "0\n", true);
    }

    /// Add a hardware target, one the driver created by itself.
    pub fn add_hw_target(&self, driver: &str, name: &str) {
        self.make_target(driver, name);
        self.fs.add_file(
            self.path(&format!("targets/{driver}/{name}/hw_target")),
            "1\n",
            false,
        );
    }

    /// Add a session to a target. A stuck session ignores `force_close`.
    pub fn add_session(&self, driver: &str, target: &str, session: &str, stuck: bool) {
        let dir = self.path(&format!("targets/{driver}/{target}/sessions/{session}"));
        self.fs.add_file(dir.join("force_close"), "0\n", true);
        if stuck {
            self.stuck.lock().insert(dir);
        }
    }

    /// Add a symlinked target group member, which can't carry attributes.
    pub fn link_target_group_member(&self, dg: &str, tg: &str, target: &str) {
        let tgs = format!("device_groups/{dg}/target_groups");
        self.fs.add_file(self.path(&format!("device_groups/{dg}/devices/mgmt")), "", true);
        self.fs.add_file(self.path(&format!("{tgs}/mgmt")), "", true);
        self.fs.add_file(self.path(&format!("{tgs}/{tg}/mgmt")), "", true);
        self.fs.add_symlink(
            self.path(&format!("{tgs}/{tg}/{target}")),
            self.path(&format!("targets/iscsi/{target}")),
        );
    }

    /// Create attribute file `rel` holding its `default`.
    pub fn attribute(&self, rel: &str, default: &str) {
        let path = self.path(rel);
        self.fs.add_file(&path, &render(Some(default), default), true);
        self.defaults.lock().insert(path, default.into());
    }

    /// An administrator for this kernel, loading no modules.
    pub fn admin(self: &Arc<Self>) -> ScstAdmin {
        self.admin_with(Settings::default())
    }

    /// Same as [`FakeScst::admin`], starting from `settings`.
    pub fn admin_with(self: &Arc<Self>, settings: Settings) -> ScstAdmin {
        let settings = Settings {
            root: ROOT.into(),
            load_modules: false,
            mgmt_timeout: Duration::from_millis(50),
            mgmt_poll_interval: Duration::from_millis(5),
            session_timeout: Duration::from_millis(50),
            session_poll_interval: Duration::from_millis(5),
            ..settings
        };
        ScstAdmin::with_parts(self.clone(), Box::new(NoModules), settings)
    }

    /// Drain the write journal as `relative/path <- value` lines.
    pub fn take_log(&self) -> Vec<String> {
        self.fs
            .take_writes()
            .into_iter()
            .map(|(path, value)| {
                let rel = path.strip_prefix(&self.root).unwrap_or(&path);
                format!("{} <- {value}", rel.display())
            })
            .collect()
    }

    /// Name of the device LUN directory `rel` exports.
    pub fn lun_device(&self, rel: &str) -> Option<String> {
        self.link_name(&self.path(rel).join("device"))
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.fs.exists(&self.path(rel))
    }

    /// Raw content of file `rel`.
    pub fn content(&self, rel: &str) -> String {
        self.fs.read(&self.path(rel)).unwrap_or_default()
    }

    /// Sorted entries of directory `rel`.
    pub fn ls(&self, rel: &str) -> Vec<String> {
        let mut names = self.fs.read_dir(&self.path(rel)).unwrap_or_default();
        names.sort();
        names
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }
}

// Private
impl FakeScst {
    fn attribute_at(&self, path: &Path, default: Option<&str>, value: &str) {
        self.fs.add_file(path, &render(default, value), true);
        if let Some(default) = default {
            self.defaults.lock().insert(path.into(), default.into());
        }
    }

    fn subdirs(&self, dir: &Path) -> Vec<PathBuf> {
        self.fs
            .read_dir(dir)
            .unwrap_or_default()
            .into_iter()
            .map(|n| dir.join(n))
            .filter(|p| self.fs.kind(p) == Some(EntryKind::Dir))
            .collect()
    }

    fn link_name(&self, path: &Path) -> Option<String> {
        let target = self.fs.read_link(path).ok()?;
        Some(target.file_name()?.to_string_lossy().into_owned())
    }

    fn make_target(&self, driver: &str, name: &str) -> PathBuf {
        let dir = self.path(&format!("targets/{driver}/{name}"));
        self.fs.add_file(dir.join("enabled"), "0\n", true);
        self.fs.add_file(dir.join("tid"), "1\n", false);
        for (file, default) in TARGET_FILES {
            self.attribute_at(&dir.join(file), Some(default), default);
        }
        self.fs.add_file(dir.join("luns/mgmt"), LUN_HELP, true);
        self.fs.add_file(dir.join("ini_groups/mgmt"), "", true);
        self.fs.add_dir(dir.join("sessions"));
        dir
    }

    /// Every `luns` directory of every target and initiator group.
    fn lun_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        for driver in self.subdirs(&self.path("targets")) {
            for target in self.subdirs(&driver) {
                dirs.push(target.join("luns"));
                for group in self.subdirs(&target.join("ini_groups")) {
                    dirs.push(group.join("luns"));
                }
            }
        }
        dirs
    }

    fn add_lun(&self, dir: &Path, number: &str, device: &str, extra: &[(String, String)]) -> io::Result<()> {
        if !self.fs.is_dir(&self.path(&format!("devices/{device}"))) {
            return Err(invalid(format!("no device {device}")));
        }
        let lun = dir.join(number);
        if self.fs.exists(&lun) {
            return Err(invalid(format!("LUN {number} exists")));
        }
        let copy_manager = dir.ends_with("copy_manager_tgt/luns");
        if copy_manager
            && self
                .subdirs(dir)
                .iter()
                .any(|l| self.link_name(&l.join("device")).as_deref() == Some(device))
        {
            return Err(invalid(format!("{device} already exported")));
        }
        self.fs
            .add_symlink(lun.join("device"), self.path(&format!("devices/{device}")));
        self.attribute_at(&lun.join("read_only"), Some("0"), "0");
        for (k, v) in extra {
            let default = (k == "read_only").then_some("0");
            self.attribute_at(&lun.join(k), default, v);
        }
        Ok(())
    }

    fn add_device(&self, handler: &str, name: &str, extra: &[(String, String)]) -> io::Result<()> {
        let dir = self.path(&format!("devices/{name}"));
        if self.fs.exists(&dir) {
            return Err(invalid(format!("device {name} exists")));
        }
        self.fs.add_dir(&dir);
        self.fs
            .add_symlink(dir.join("handler"), self.path(&format!("handlers/{handler}")));
        self.fs
            .add_symlink(self.path(&format!("handlers/{handler}/{name}")), &dir);
        self.fs.add_file(dir.join("type"), "0 - direct access device\n", false);
        for (file, default) in DEVICE_FILES {
            self.attribute_at(&dir.join(file), Some(default), default);
        }
        for (k, v) in extra {
            let default = DEVICE_FILES.iter().find(|(f, _)| f == k).map(|(_, d)| *d);
            self.attribute_at(&dir.join(k), default, v);
        }

        let cm = self.path("targets/copy_manager/copy_manager_tgt/luns");
        let used: HashSet<u64> = self
            .subdirs(&cm)
            .iter()
            .filter_map(|p| p.file_name()?.to_str()?.parse().ok())
            .collect();
        let free = (0..).find(|n| !used.contains(n)).unwrap_or_default();
        self.add_lun(&cm, &free.to_string(), name, &[])
    }

    fn del_device(&self, handler: &str, name: &str) -> io::Result<()> {
        let dir = self.path(&format!("devices/{name}"));
        if !self.fs.exists(&dir) {
            return Err(invalid(format!("no device {name}")));
        }
        for luns in self.lun_dirs() {
            for lun in self.subdirs(&luns) {
                if self.link_name(&lun.join("device")).as_deref() == Some(name) {
                    self.fs.remove(&lun);
                }
            }
        }
        for dg in self.subdirs(&self.path("device_groups")) {
            self.fs.remove(dg.join("devices").join(name));
        }
        self.fs.remove(self.path(&format!("handlers/{handler}/{name}")));
        self.fs.remove(&dir);
        Ok(())
    }

    /// Values of numbered attribute `attr` under `dir`, in order.
    fn numbered(&self, dir: &Path, attr: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .fs
            .read_dir(dir)
            .unwrap_or_default()
            .into_iter()
            .filter(|n| is_variant(n, attr))
            .collect();
        names.sort_by_key(|n| n[attr.len()..].parse::<u64>().unwrap_or(0));
        names
            .iter()
            .filter_map(|n| self.fs.read(&dir.join(n)).ok())
            .filter_map(|c| c.lines().next().map(String::from))
            .collect()
    }

    /// Store `values` as `attr`, `attr1`, `attr2`, ...
    fn renumber(&self, dir: &Path, attr: &str, values: &[String]) {
        for name in self.fs.read_dir(dir).unwrap_or_default() {
            if is_variant(&name, attr) {
                self.fs.remove(dir.join(name));
            }
        }
        for (i, v) in values.iter().enumerate() {
            let name = if i == 0 {
                attr.to_owned()
            } else {
                format!("{attr}{i}")
            };
            self.fs.add_file(dir.join(name), &render(None, v), true);
        }
    }

    fn add_value(&self, dir: &Path, attr: &str, value: &str) -> io::Result<()> {
        if !self.fs.is_dir(dir) {
            return Err(invalid(format!("no {}", dir.display())));
        }
        let mut values = self.numbered(dir, attr);
        values.push(value.into());
        self.renumber(dir, attr, &values);
        Ok(())
    }

    fn del_value(&self, dir: &Path, attr: &str, value: &str) -> io::Result<()> {
        let mut values = self.numbered(dir, attr);
        let pos = values
            .iter()
            .position(|v| v == value)
            .ok_or_else(|| invalid(format!("{attr} has no value {value}")))?;
        values.remove(pos);
        self.renumber(dir, attr, &values);
        Ok(())
    }

    fn create(&self, path: &Path, files: &[&str]) -> io::Result<()> {
        if self.fs.exists(path) {
            return Err(invalid(format!("{} exists", path.display())));
        }
        self.fs.add_dir(path);
        for f in files {
            let help = if f.ends_with("luns/mgmt") { LUN_HELP } else { "" };
            self.fs.add_file(path.join(f), help, true);
        }
        Ok(())
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        if self.fs.kind(path).is_none() {
            return Err(invalid(format!("no {}", path.display())));
        }
        self.fs.remove(path);
        Ok(())
    }

    /// Run the management command `cmd` written to `mgmt`.
    fn command(&self, mgmt: &Path, cmd: &str) -> io::Result<()> {
        let dir = mgmt.parent().unwrap_or(mgmt);
        let rel: Vec<&str> = dir
            .strip_prefix(&self.root)
            .map_err(|_| invalid("outside root"))?
            .iter()
            .filter_map(|c| c.to_str())
            .collect();
        let (verb, rest) = cmd.split_once(' ').unwrap_or((cmd, ""));
        let (first, tail) = rest.split_once(' ').unwrap_or((rest, ""));

        match (rel.as_slice(), verb) {
            (["handlers", handler], "add_device") => self.add_device(handler, first, &params(tail)),
            (["handlers", handler], "del_device") => self.del_device(handler, first),

            (["targets", driver], "add_target") => {
                if self.fs.exists(&dir.join(first)) {
                    return Err(invalid(format!("target {first} exists")));
                }
                let target = self.make_target(driver, first);
                for (k, v) in params(tail) {
                    self.attribute_at(&target.join(k), None, &v);
                }
                Ok(())
            }
            (["targets", _], "del_target") => {
                if self.fs.exists(&dir.join(first).join("hw_target")) {
                    return Err(invalid(format!("{first} is a hardware target")));
                }
                self.delete(&dir.join(first))
            }
            (["targets", _], "add_target_attribute" | "del_target_attribute") => {
                let (attr, value) = tail.split_once(' ').ok_or_else(|| invalid(cmd))?;
                let target = dir.join(first);
                if verb == "add_target_attribute" {
                    self.add_value(&target, attr, value)
                } else {
                    self.del_value(&target, attr, value)
                }
            }
            (["targets", _], "add_attribute") => self.add_value(dir, first, tail),
            (["targets", _], "del_attribute") => self.del_value(dir, first, tail),

            ([.., "luns"], "add") => {
                let (number, extra) = tail.split_once(' ').unwrap_or((tail, ""));
                self.add_lun(dir, number, first, &params(extra))
            }
            ([.., "luns"], "del") => self.delete(&dir.join(first)),
            ([.., "luns"], "clear") => {
                for lun in self.subdirs(dir) {
                    self.fs.remove(lun);
                }
                Ok(())
            }

            ([.., "ini_groups"], "create") => {
                self.create(&dir.join(first), &["initiators/mgmt", "luns/mgmt"])
            }
            ([.., "ini_groups"], "del") => self.delete(&dir.join(first)),
            ([.., "initiators"], "add") => {
                if self.fs.exists(&dir.join(rest)) {
                    return Err(invalid(format!("{rest} exists")));
                }
                self.fs.add_file(dir.join(rest), "", false);
                Ok(())
            }
            ([.., "initiators"], "del") => self.delete(&dir.join(rest)),

            (["device_groups"], "create") => {
                self.create(&dir.join(first), &["devices/mgmt", "target_groups/mgmt"])
            }
            (["device_groups"], "del") => {
                let dg = dir.join(first);
                let busy = ["devices", "target_groups"].iter().any(|sub| {
                    let names = self.fs.read_dir(&dg.join(sub)).unwrap_or_default();
                    names.iter().any(|n| n != "mgmt")
                });
                if busy {
                    return Err(invalid(format!("device group {first} is not empty")));
                }
                self.delete(&dg)
            }
            (["device_groups", _, "devices"], "add") => {
                let device = self.path(&format!("devices/{first}"));
                if !self.fs.is_dir(&device) {
                    return Err(invalid(format!("no device {first}")));
                }
                self.fs.add_symlink(dir.join(first), device);
                Ok(())
            }
            (["device_groups", _, "devices"], "del") => self.delete(&dir.join(first)),
            (["device_groups", _, "target_groups"], "add") => {
                let tg = dir.join(first);
                self.create(&tg, &["mgmt"])?;
                self.attribute_at(&tg.join("group_id"), Some("0"), "0");
                self.attribute_at(&tg.join("state"), Some("active"), "active");
                Ok(())
            }
            (["device_groups", _, "target_groups"], "del") => self.delete(&dir.join(first)),
            (["device_groups", _, "target_groups", _], "add") => {
                let member = dir.join(first);
                self.create(&member, &[])?;
                self.attribute_at(&member.join("rel_tgt_id"), Some("0"), "0");
                Ok(())
            }
            (["device_groups", _, "target_groups", _], "del") => self.delete(&dir.join(first)),

            _ => Err(invalid(format!("unknown command `{cmd}` for {}", mgmt.display()))),
        }
    }
}

impl ControlFs for FakeScst {
    fn kind(&self, path: &Path) -> Option<EntryKind> {
        self.fs.kind(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.fs.exists(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.fs.is_dir(path)
    }

    fn read(&self, path: &Path) -> io::Result<String> {
        self.fs.read(path)
    }

    fn write(&self, path: &Path, data: &str) -> io::Result<()> {
        if !self.fs.writable(path) {
            return Err(io::ErrorKind::PermissionDenied.into());
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if name == "mgmt" {
            self.command(path, data.trim())?;
            return self.fs.write(path, data);
        }

        self.fs.write(path, data)?;
        match name {
            "enabled" | "suspend" => {
                self.fs.set_content(path, &format!("{}\n", data.trim()));
            }
            "force_close" => {
                let session = path.parent().unwrap_or(path);
                if !self.stuck.lock().contains(session) {
                    self.fs.remove(session);
                }
            }
            _ => {
                let default = self.defaults.lock().get(path).cloned();
                self.fs.set_content(path, &render(default.as_deref(), data));
            }
        }
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        self.fs.read_dir(path)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        self.fs.read_link(path)
    }

    fn writable(&self, path: &Path) -> bool {
        self.fs.writable(path)
    }
}

/// Every module is already loaded.
#[derive(Debug)]
pub struct NoModules;

impl ModuleLoader for NoModules {
    fn is_loaded(&self, _: &str) -> bool {
        true
    }

    fn is_installed(&self, _: &str) -> bool {
        true
    }

    fn load(&self, _: &str) -> modules::Result<()> {
        Ok(())
    }
}

/// Nothing is loaded, loads are recorded and `missing` ones fail.
#[derive(Debug, Default)]
pub struct RecordingLoader {
    pub loaded: Arc<Mutex<Vec<String>>>,
    pub missing: Vec<String>,
}

impl ModuleLoader for RecordingLoader {
    fn is_loaded(&self, name: &str) -> bool {
        self.loaded.lock().iter().any(|m| m == name)
    }

    fn is_installed(&self, _: &str) -> bool {
        true
    }

    fn load(&self, name: &str) -> modules::Result<()> {
        if self.missing.iter().any(|m| m == name) {
            return Err(scstadmin::error::ModuleError::LoadError(
                name.into(),
                "not found".into(),
            ));
        }
        self.loaded.lock().push(name.into());
        Ok(())
    }
}

pub fn config(text: &str) -> Configuration {
    parser::parse(text).unwrap()
}
