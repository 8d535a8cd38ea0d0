//! Writing a [`Configuration`] back out in the text format.
//!
//! The output parses back into an equal [`Configuration`].
use std::fmt::{self, Display, Formatter, Write};

use super::{Attributes, Configuration, HandlerKind, Lun};

const INDENT: &str = "\t";

struct Indented<'a, 'b> {
    f: &'a mut Formatter<'b>,
    depth: usize,
}

impl Indented<'_, '_> {
    fn line(&mut self, args: fmt::Arguments<'_>) -> fmt::Result {
        for _ in 0..self.depth {
            self.f.write_str(INDENT)?;
        }
        self.f.write_fmt(args)?;
        self.f.write_char('\n')
    }

    fn open(&mut self, args: fmt::Arguments<'_>) -> fmt::Result {
        self.line(format_args!("{args} {{"))?;
        self.depth += 1;
        Ok(())
    }

    fn close(&mut self) -> fmt::Result {
        self.depth -= 1;
        self.line(format_args!("}}"))
    }

    /// One line per value of multi-valued attributes.
    fn attributes(&mut self, attrs: &Attributes) -> fmt::Result {
        for (key, value) in attrs {
            for v in value.split(';') {
                self.line(format_args!("{key} {}", Quoted(v)))?;
            }
        }
        Ok(())
    }

    fn lun(&mut self, number: &str, lun: &Lun) -> fmt::Result {
        let head = match &lun.device {
            Some(dev) => format!("LUN {number} {dev}"),
            None => format!("LUN {number}"),
        };
        if lun.attributes.is_empty() {
            return self.line(format_args!("{head}"));
        }
        self.open(format_args!("{head}"))?;
        self.attributes(&lun.attributes)?;
        self.close()
    }
}

/// Quote values the parser would otherwise split or misread.
struct Quoted<'a>(&'a str);

impl Display for Quoted<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = self.0;
        let plain = !s.is_empty()
            && !s.contains(|c: char| c.is_whitespace() || "{}#=\"'".contains(c));
        if plain {
            f.write_str(s)
        } else if s.contains('"') {
            write!(f, "'{s}'")
        } else {
            write!(f, "\"{s}\"")
        }
    }
}

impl Display for Configuration {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut w = Indented { f, depth: 0 };
        if !self.attributes.is_empty() {
            w.attributes(&self.attributes)?;
            w.line(format_args!(""))?;
        }

        for handler in self.handler_names() {
            w.open(format_args!("HANDLER {handler}"))?;
            if let Some(attrs) = self.handlers.get(&handler) {
                w.attributes(attrs)?;
            }
            if let Some(kind) = HandlerKind::from_name(&handler) {
                for dev in self.devices_of(kind) {
                    w.open(format_args!("DEVICE {}", dev.name))?;
                    for (key, value) in dev.all_attributes() {
                        w.line(format_args!("{key} {}", Quoted(value)))?;
                    }
                    w.close()?;
                }
            }
            w.close()?;
            w.line(format_args!(""))?;
        }

        for driver in self.drivers.values() {
            w.open(format_args!("TARGET_DRIVER {}", driver.name))?;
            w.attributes(&driver.attributes)?;
            for target in driver.targets.values() {
                w.open(format_args!("TARGET {}", target.name))?;
                w.attributes(&target.attributes)?;
                for (number, lun) in &target.luns {
                    w.lun(number, lun)?;
                }
                for group in target.groups.values() {
                    w.open(format_args!("GROUP {}", group.name))?;
                    for ini in &group.initiators {
                        w.line(format_args!("INITIATOR {ini}"))?;
                    }
                    for (number, lun) in &group.luns {
                        w.lun(number, lun)?;
                    }
                    w.attributes(&group.attributes)?;
                    w.close()?;
                }
                w.close()?;
            }
            w.close()?;
            w.line(format_args!(""))?;
        }

        for dg in self.device_groups.values() {
            w.open(format_args!("DEVICE_GROUP {}", dg.name))?;
            for dev in &dg.devices {
                w.line(format_args!("DEVICE {dev}"))?;
            }
            w.attributes(&dg.attributes)?;
            for tg in dg.target_groups.values() {
                w.open(format_args!("TARGET_GROUP {}", tg.name))?;
                w.attributes(&tg.attributes)?;
                for target in &tg.targets {
                    match tg.target_attributes.get(target) {
                        Some(attrs) if !attrs.is_empty() => {
                            w.open(format_args!("TARGET {target}"))?;
                            w.attributes(attrs)?;
                            w.close()?;
                        }
                        _ => w.line(format_args!("TARGET {target}"))?,
                    }
                }
                w.close()?;
            }
            w.close()?;
            w.line(format_args!(""))?;
        }
        Ok(())
    }
}
