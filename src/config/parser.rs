//! Parser for the `scst.conf` text format.
//!
//! ```text
//! # Comment
//! HANDLER vdisk_fileio {
//!     DEVICE disk1 {
//!         filename /srv/disk1.img
//!         blocksize 4096
//!     }
//! }
//!
//! TARGET_DRIVER iscsi {
//!     enabled 1
//!     TARGET iqn.2005-10.org.example:t1 {
//!         IncomingUser "joe secret1"
//!         IncomingUser "ann secret2"
//!         LUN 0 disk1
//!         GROUP hosts {
//!             INITIATOR iqn.1994-05.com.redhat:\#1
//!             LUN 0 disk1 {
//!                 read_only 1
//!             }
//!         }
//!         enabled 1
//!     }
//! }
//!
//! DEVICE_GROUP dg {
//!     DEVICE disk1
//!     TARGET_GROUP local {
//!         group_id 1
//!         state active
//!         TARGET iqn.2005-10.org.example:t1 {
//!             rel_tgt_id 1
//!         }
//!     }
//! }
//! ```
//!
//! Attributes are `key value` or `key=value`. Values may be quoted with `'`
//! or `"`, quotes are removed and nothing else. Repeating a key joins the
//! values with `;`.
//!
//! The opening brace of a block goes on the header line or the line after
//! it, and a header without a brace is an empty block. Braces may also share
//! a line with their contents.
//!
//! Unknown top-level lines are logged and skipped. A block header without
//! a name, or unbalanced braces, is an error.
use std::{fs, ops::Range, path::Path};

use tracing::{debug, info, warn};

use super::{
    Attributes,
    Configuration,
    Device,
    DeviceGroup,
    Driver,
    InitiatorGroup,
    Lun,
    Luns,
    Target,
    TargetGroup,
};
use crate::{error::ParseError, util::unquote};

pub type Result<T, E = ParseError> = std::result::Result<T, E>;

/// Parse the configuration file at `path`.
///
/// # Errors
///
/// - If `path` couldn't be read
/// - See [`parse`]
pub fn parse_file(path: &Path) -> Result<Configuration> {
    info!(path = %path.display(), "parsing configuration");
    let text = fs::read_to_string(path)?;
    parse(&text)
}

/// Parse configuration `text`.
///
/// # Errors
///
/// - On a block header without a name
/// - On unbalanced braces
/// - On a malformed `LUN` or `INITIATOR` line
/// - On a device of an unknown handler
pub fn parse(text: &str) -> Result<Configuration> {
    let parser = Parser {
        lines: logical_lines(text),
    };
    let mut config = Configuration::default();
    parser.top_level(&mut config)?;
    debug!(
        handlers = config.handlers.len(),
        devices = config.devices.len(),
        drivers = config.drivers.len(),
        device_groups = config.device_groups.len(),
        "parsed configuration"
    );
    Ok(config)
}

/// One logical line, with its 1-based source line number.
#[derive(Debug)]
struct Line {
    no: usize,
    text: String,
}

/// Strip comments and blank lines, and put braces on lines of their own.
///
/// An opening brace stays on its header line, `A { b }` becomes `A {`, `b`,
/// `}`. Braces inside quotes are left alone.
fn logical_lines(text: &str) -> Vec<Line> {
    let mut out = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let no = idx + 1;
        let mut push = |s: &str| {
            let s = s.trim();
            if !s.is_empty() {
                out.push(Line { no, text: s.into() });
            }
        };
        let mut quote = None;
        let mut start = 0;
        for (i, c) in line.char_indices() {
            match (c, quote) {
                ('"' | '\'', None) => quote = Some(c),
                (c, Some(q)) if c == q => quote = None,
                ('{', None) => {
                    let head = line[start..i].trim();
                    push(&if head.is_empty() {
                        "{".to_owned()
                    } else {
                        format!("{head} {{")
                    });
                    start = i + 1;
                }
                ('}', None) => {
                    push(&line[start..i]);
                    push("}");
                    start = i + 1;
                }
                _ => {}
            }
        }
        push(&line[start..]);
    }
    out
}

/// A located block, `KEYWORD name args.. { body }`.
#[derive(Debug)]
struct Block<'a> {
    /// Header words after the keyword, without the brace.
    words: Vec<&'a str>,
    body: Range<usize>,
    /// Index of the line after the block.
    next: usize,
}

impl Block<'_> {
    fn name(&self) -> &str {
        self.words[0]
    }
}

struct Parser {
    lines: Vec<Line>,
}

// Private
impl Parser {
    fn keyword(&self, i: usize) -> &str {
        self.lines[i].text.split_whitespace().next().unwrap_or_default()
    }

    fn is_block_start(&self, i: usize) -> bool {
        let text = &self.lines[i].text;
        text.ends_with('{') || self.lines.get(i + 1).map_or(false, |l| l.text == "{")
    }

    /// Locate the block whose header is line `i`.
    ///
    /// Lines inside are not interpreted beyond brace counting.
    fn block(&self, i: usize) -> Result<Block<'_>> {
        let header = &self.lines[i];
        let keyword = self.keyword(i);
        let has_brace = header.text.ends_with('{');
        let words: Vec<&str> = header
            .text
            .trim_end_matches('{')
            .split_whitespace()
            .skip(1)
            .collect();
        if words.is_empty() {
            return Err(ParseError::MissingName {
                line: header.no,
                keyword: keyword.into(),
            });
        }
        let start = if has_brace {
            i + 1
        } else if self.lines.get(i + 1).map_or(false, |l| l.text == "{") {
            i + 2
        } else {
            return Ok(Block {
                words,
                body: i + 1..i + 1,
                next: i + 1,
            });
        };
        let mut depth = 1;
        let mut j = start;
        while j < self.lines.len() {
            let text = &self.lines[j].text;
            if text.ends_with('{') {
                depth += 1;
            } else if text == "}" {
                depth -= 1;
                if depth == 0 {
                    return Ok(Block {
                        words,
                        body: start..j,
                        next: j + 1,
                    });
                }
            }
            j += 1;
        }
        Err(ParseError::UnmatchedBraces {
            line: header.no,
            keyword: keyword.into(),
        })
    }

    /// Skip a block nobody understands, still checking its braces.
    fn skip_block(&self, i: usize) -> Result<usize> {
        let line = &self.lines[i];
        warn!(line = line.no, text = %line.text, "ignoring unknown block");
        if line.text == "{" {
            // Anonymous block
            let mut depth = 0;
            for (j, l) in self.lines.iter().enumerate().skip(i) {
                if l.text.ends_with('{') {
                    depth += 1;
                } else if l.text == "}" {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(j + 1);
                    }
                }
            }
            return Err(ParseError::UnmatchedBraces {
                line: line.no,
                keyword: "{".into(),
            });
        }
        Ok(self.block(i)?.next)
    }

    /// Parse an attribute line into `attrs`, joining repeated keys.
    ///
    /// Lines which aren't attributes are logged and skipped.
    fn attribute(&self, i: usize, attrs: &mut Attributes) {
        let line = &self.lines[i];
        match split_attribute(&line.text) {
            Some((key, value)) => {
                attrs
                    .entry(key.into())
                    .and_modify(|v| {
                        v.push(';');
                        v.push_str(value);
                    })
                    .or_insert_with(|| value.into());
            }
            None => warn!(line = line.no, text = %line.text, "ignoring unrecognized line"),
        }
    }

    /// Walk lines in `range`. `f` handles keywords it knows and returns the
    /// index of the next line, or `None` to treat the line as an attribute.
    fn walk(
        &self,
        range: Range<usize>,
        attrs: &mut Attributes,
        mut f: impl FnMut(&Self, usize, &str) -> Result<Option<usize>>,
    ) -> Result<()> {
        let mut i = range.start;
        while i < range.end {
            if self.lines[i].text == "}" {
                return Err(ParseError::StrayBrace {
                    line: self.lines[i].no,
                });
            }
            let keyword = self.keyword(i).to_owned();
            if let Some(next) = f(self, i, &keyword)? {
                i = next;
            } else if self.is_block_start(i) {
                i = self.skip_block(i)?;
            } else {
                self.attribute(i, attrs);
                i += 1;
            }
        }
        Ok(())
    }

    fn top_level(&self, config: &mut Configuration) -> Result<()> {
        let mut globals = Attributes::new();
        self.walk(0..self.lines.len(), &mut globals, |p, i, keyword| {
            Ok(Some(match keyword {
                "HANDLER" => p.handler(i, config)?,
                "TARGET_DRIVER" => p.driver(i, config)?,
                "DEVICE_GROUP" => p.device_group(i, config)?,
                _ => return Ok(None),
            }))
        })?;
        config.attributes = globals;
        Ok(())
    }

    fn handler(&self, i: usize, config: &mut Configuration) -> Result<usize> {
        let block = self.block(i)?;
        let handler = block.name().to_owned();
        let mut attrs = Attributes::new();
        let mut devices = Vec::new();
        self.walk(block.body.clone(), &mut attrs, |p, i, keyword| {
            if keyword != "DEVICE" {
                return Ok(None);
            }
            let dev = p.block(i)?;
            let mut dev_attrs = Attributes::new();
            p.walk(dev.body.clone(), &mut dev_attrs, |_, _, _| Ok(None))?;
            let device = Device::new(dev.name(), &handler, dev_attrs).map_err(|source| {
                ParseError::Model {
                    line: p.lines[i].no,
                    source,
                }
            })?;
            note_unknown_attributes(&device);
            devices.push(device);
            Ok(Some(dev.next))
        })?;
        for device in devices {
            config.devices.insert(device.name.clone(), device);
        }
        config.handlers.insert(handler, attrs);
        Ok(block.next)
    }

    fn driver(&self, i: usize, config: &mut Configuration) -> Result<usize> {
        let block = self.block(i)?;
        let mut driver = Driver {
            name: block.name().into(),
            ..Default::default()
        };
        let mut targets = Vec::new();
        self.walk(block.body.clone(), &mut driver.attributes, |p, i, keyword| {
            if keyword != "TARGET" {
                return Ok(None);
            }
            let (target, next) = p.target(i)?;
            targets.push(target);
            Ok(Some(next))
        })?;
        driver.targets = targets.into_iter().map(|t| (t.name.clone(), t)).collect();
        config.drivers.insert(driver.name.clone(), driver);
        Ok(block.next)
    }

    fn target(&self, i: usize) -> Result<(Target, usize)> {
        let block = self.block(i)?;
        let mut target = Target {
            name: block.name().into(),
            ..Default::default()
        };
        let mut luns = Luns::new();
        let mut groups = Vec::new();
        self.walk(block.body.clone(), &mut target.attributes, |p, i, keyword| {
            Ok(Some(match keyword {
                "LUN" => p.lun(i, &mut luns)?,
                "GROUP" => {
                    let (group, next) = p.group(i)?;
                    groups.push(group);
                    next
                }
                _ => return Ok(None),
            }))
        })?;
        target.luns = luns;
        target.groups = groups.into_iter().map(|g| (g.name.clone(), g)).collect();
        Ok((target, block.next))
    }

    fn group(&self, i: usize) -> Result<(InitiatorGroup, usize)> {
        let block = self.block(i)?;
        let mut group = InitiatorGroup {
            name: block.name().into(),
            ..Default::default()
        };
        let mut luns = Luns::new();
        let mut initiators = Vec::new();
        self.walk(block.body.clone(), &mut group.attributes, |p, i, keyword| {
            Ok(Some(match keyword {
                "LUN" => p.lun(i, &mut luns)?,
                "INITIATOR" => {
                    initiators.push(p.single_word(i)?);
                    i + 1
                }
                _ => return Ok(None),
            }))
        })?;
        group.luns = luns;
        group.initiators = initiators;
        Ok((group, block.next))
    }

    /// `LUN <number> [<device>] [{ attributes }]`
    fn lun(&self, i: usize, luns: &mut Luns) -> Result<usize> {
        let line = &self.lines[i];
        let words: Vec<&str> = line.text.trim_end_matches('{').split_whitespace().collect();
        let (number, device) = match words[..] {
            [_, number] => (number, None),
            [_, number, device] => (number, Some(device.to_owned())),
            _ => {
                return Err(ParseError::MalformedLun {
                    line: line.no,
                    text: line.text.clone(),
                })
            }
        };
        let block = self.block(i)?;
        let mut lun = Lun {
            device,
            ..Default::default()
        };
        self.walk(block.body.clone(), &mut lun.attributes, |_, _, _| Ok(None))?;
        luns.insert(number.into(), lun);
        Ok(block.next)
    }

    fn device_group(&self, i: usize, config: &mut Configuration) -> Result<usize> {
        let block = self.block(i)?;
        let mut group = DeviceGroup {
            name: block.name().into(),
            ..Default::default()
        };
        let mut devices = Vec::new();
        let mut target_groups = Vec::new();
        self.walk(block.body.clone(), &mut group.attributes, |p, i, keyword| {
            Ok(Some(match keyword {
                "DEVICE" => {
                    devices.push(p.single_word(i)?);
                    i + 1
                }
                "TARGET_GROUP" => {
                    let (tg, next) = p.target_group(i)?;
                    target_groups.push(tg);
                    next
                }
                _ => return Ok(None),
            }))
        })?;
        group.devices = devices;
        group.target_groups = target_groups.into_iter().map(|t| (t.name.clone(), t)).collect();
        config.device_groups.insert(group.name.clone(), group);
        Ok(block.next)
    }

    fn target_group(&self, i: usize) -> Result<(TargetGroup, usize)> {
        let block = self.block(i)?;
        let mut tg = TargetGroup {
            name: block.name().into(),
            ..Default::default()
        };
        let mut targets = Vec::new();
        self.walk(block.body.clone(), &mut tg.attributes, |p, i, keyword| {
            if keyword != "TARGET" {
                return Ok(None);
            }
            let target = p.block(i)?;
            let mut attrs = Attributes::new();
            p.walk(target.body.clone(), &mut attrs, |_, _, _| Ok(None))?;
            targets.push((target.name().to_owned(), attrs));
            Ok(Some(target.next))
        })?;
        for (name, attrs) in targets {
            if !attrs.is_empty() {
                tg.target_attributes.insert(name.clone(), attrs);
            }
            tg.targets.push(name);
        }
        Ok((tg, block.next))
    }

    /// `KEYWORD value`, as used by `INITIATOR` and `DEVICE` membership.
    fn single_word(&self, i: usize) -> Result<String> {
        let line = &self.lines[i];
        match line.text.split_whitespace().collect::<Vec<_>>()[..] {
            [_, value] => Ok(unquote(value).to_owned()),
            _ => Err(ParseError::MalformedAttribute {
                line: line.no,
                text: line.text.clone(),
            }),
        }
    }
}

/// `key=value` or `key value`, value unquoted.
///
/// `=` only separates if nothing before it is whitespace, so
/// `IncomingUser "joe pa=ss"` is a space-separated pair.
fn split_attribute(line: &str) -> Option<(&str, &str)> {
    if let Some((key, value)) = line.split_once('=') {
        let key = key.trim();
        if !key.is_empty() && !key.contains(char::is_whitespace) {
            return Some((key, unquote(value.trim())));
        }
    }
    let (key, value) = line.split_once(char::is_whitespace)?;
    Some((key, unquote(value.trim())))
}

fn note_unknown_attributes(device: &Device) {
    let known = device.handler.known_attributes();
    for key in device.attributes.keys() {
        if !known.contains(&key.as_str()) {
            debug!(device = %device.name, handler = %device.handler, key = %key, "attribute not known for handler, passing it through");
        }
    }
}
