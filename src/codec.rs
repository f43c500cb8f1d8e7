//! Set-line codec: between structured option records and flat
//! imperative configuration text.
//!
//! One entity type is described once, by a declarative [`FieldTable`]
//! mapping line prefixes to field accessors. A single generic encode walk
//! turns a record into ordered `set` lines, and a single generic decode
//! loop turns a device's `display set relative` dump back into a record.
//! This keeps per-feature codecs data-driven instead of growing a cascade
//! of string comparisons per entity.
//!
//! Round-trip law: for every field a table is responsible for,
//! `decode(relativize(encode(record))) == record`. Fields left at their
//! defaults are exempt because absence of a line *is* the encoding of
//! "not set".

use log::trace;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// An ordered sequence of imperative configuration lines.
///
/// Built fresh per operation and never mutated after submission. Order is
/// significant within one delta: a parent line must precede children that
/// assume its existence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigDelta {
    lines: Vec<String>,
}

impl ConfigDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a `set <path>` line.
    pub fn set(&mut self, path: &str) {
        self.lines.push(format!("set {path}"));
    }

    /// Appends a `delete <path>` line.
    pub fn delete(&mut self, path: &str) {
        self.lines.push(format!("delete {path}"));
    }

    /// Appends an already-formed line.
    pub fn push_line(&mut self, line: String) {
        self.lines.push(line);
    }

    /// Appends all lines of `other`, preserving order.
    pub fn extend(&mut self, other: ConfigDelta) {
        self.lines.extend(other.lines);
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Renders the delta as newline-terminated text.
    pub fn to_text(&self) -> String {
        if self.lines.is_empty() {
            return String::new();
        }
        let mut text = self.lines.join("\n");
        text.push('\n');
        text
    }
}

/// One declarative mapping between a line prefix and a record field.
///
/// The same rule drives both directions: `emit` produces line suffixes
/// from the record, the absorb side parses a suffix back into the record.
pub enum FieldRule<R> {
    /// An optional single-valued field: `prefix <value>`.
    Scalar {
        prefix: &'static str,
        emit: fn(&R) -> Option<String>,
        absorb: fn(&mut R, &str) -> Result<(), String>,
    },
    /// A presence-only field: the bare `prefix` line.
    Flag {
        prefix: &'static str,
        emit: fn(&R) -> bool,
        absorb: fn(&mut R),
    },
    /// A repeated simple value: one `prefix <value>` line per element.
    Many {
        prefix: &'static str,
        emit: fn(&R) -> Vec<String>,
        absorb: fn(&mut R, &str) -> Result<(), String>,
    },
    /// A list-typed sub-block keyed by an inner name:
    /// `prefix <key> <sub-line>` repeated per sub-record line.
    ///
    /// During decode, the first line carrying a key different from the
    /// currently open one calls `open`; subsequent lines with the same key
    /// are absorbed into that sub-record. Two distinct keys are never
    /// merged.
    Block {
        prefix: &'static str,
        emit: fn(&R) -> Vec<(String, Vec<String>)>,
        open: fn(&mut R, &str),
        absorb: fn(&mut R, &str) -> Result<(), String>,
    },
}

impl<R> FieldRule<R> {
    fn prefix(&self) -> &'static str {
        match self {
            FieldRule::Scalar { prefix, .. }
            | FieldRule::Flag { prefix, .. }
            | FieldRule::Many { prefix, .. }
            | FieldRule::Block { prefix, .. } => prefix,
        }
    }
}

/// Ordered field rules for one entity type.
///
/// Encode order follows table order, which makes encoding deterministic
/// and keeps parent lines ahead of dependent children.
pub struct FieldTable<R> {
    rules: Vec<FieldRule<R>>,
}

impl<R> FieldTable<R> {
    pub fn new(rules: Vec<FieldRule<R>>) -> Self {
        Self { rules }
    }

    /// Encodes `record` into `set` lines rooted at `base`.
    ///
    /// Always emits the bare `set <base>` line first so that a record with
    /// no optional fields still creates the entity. Zero-value and absent
    /// optional fields produce no line.
    pub fn encode(&self, record: &R, base: &str) -> ConfigDelta {
        let mut delta = ConfigDelta::new();
        delta.set(base);
        for rule in &self.rules {
            match rule {
                FieldRule::Scalar { prefix, emit, .. } => {
                    if let Some(value) = emit(record) {
                        delta.set(&format!("{base} {prefix} {value}"));
                    }
                }
                FieldRule::Flag { prefix, emit, .. } => {
                    if emit(record) {
                        delta.set(&format!("{base} {prefix}"));
                    }
                }
                FieldRule::Many { prefix, emit, .. } => {
                    for value in emit(record) {
                        delta.set(&format!("{base} {prefix} {value}"));
                    }
                }
                FieldRule::Block { prefix, emit, .. } => {
                    for (key, sub_lines) in emit(record) {
                        if sub_lines.is_empty() {
                            delta.set(&format!("{base} {prefix} {key}"));
                        }
                        for sub in sub_lines {
                            delta.set(&format!("{base} {prefix} {key} {sub}"));
                        }
                    }
                }
            }
        }
        delta
    }

    /// Dispatches one relativized line body (without the leading `set `)
    /// into `record`.
    ///
    /// Returns false when no rule matches; unknown lines are the caller's
    /// decision to skip or reject.
    fn dispatch(
        &self,
        record: &mut R,
        body: &str,
        open_keys: &mut [Option<String>],
    ) -> Result<bool, String> {
        // Longest-prefix match keeps e.g. "destination-port" from being
        // shadowed by a hypothetical "destination" rule.
        let mut best: Option<(usize, &str)> = None;
        for (idx, rule) in self.rules.iter().enumerate() {
            if let Some(rest) = match_prefix(rule.prefix(), body)
                && best
                    .map(|(b, _)| rule.prefix().len() > self.rules[b].prefix().len())
                    .unwrap_or(true)
            {
                best = Some((idx, rest));
            }
        }
        let Some((idx, rest)) = best else {
            return Ok(false);
        };

        match &self.rules[idx] {
            FieldRule::Scalar { absorb, .. } | FieldRule::Many { absorb, .. } => {
                absorb(record, rest)?;
            }
            FieldRule::Flag { absorb, .. } => absorb(record),
            FieldRule::Block { open, absorb, .. } => {
                let (key, sub) = match rest.split_once(' ') {
                    Some((key, sub)) => (key, Some(sub)),
                    None => (rest, None),
                };
                if open_keys[idx].as_deref() != Some(key) {
                    open(record, key);
                    open_keys[idx] = Some(key.to_string());
                }
                if let Some(sub) = sub {
                    absorb(record, sub)?;
                }
            }
        }
        Ok(true)
    }
}

fn match_prefix<'l>(prefix: &str, body: &'l str) -> Option<&'l str> {
    if body == prefix {
        return Some("");
    }
    body.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix(' '))
}

/// A structured configuration entity that the codec can translate.
///
/// Identity is a natural key, commonly a name string or a composite of
/// names, and determines both the display key used in errors and the
/// configuration path the entity lives under.
pub trait Resource: Clone + PartialEq + std::fmt::Debug {
    /// Natural key used in log lines and error context.
    fn key(&self) -> String;

    /// Configuration path the entity's lines are rooted at,
    /// e.g. `applications application ssh-custom`.
    fn base_path(&self) -> String;

    /// Declarative field table shared by encode and decode.
    fn table() -> FieldTable<Self>
    where
        Self: Sized;

    /// A copy of `self` carrying only identity fields, used as the seed
    /// for decoding a device dump.
    fn skeleton(&self) -> Self;

    /// Cross-field invariants checked before any line is produced.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// Encodes one record into its configuration delta.
///
/// Fails fast with a validation error on contradictory field
/// combinations, before producing any line.
pub fn encode_resource<R: Resource>(record: &R) -> Result<ConfigDelta, ConfigError> {
    record.validate()?;
    Ok(R::table().encode(record, &record.base_path()))
}

/// Decodes a per-entity `display set relative` dump into a record.
///
/// Framing markers from structured replies (`<...>` lines) are skipped
/// and a matching end marker (`</...>`) stops the scan. A dump containing
/// no `set` lines decodes to `None`: the entity does not exist, which is
/// distinct from a zero-valued entity.
pub fn decode_dump<R: Resource>(probe: &R, raw: &str) -> Result<Option<R>, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(None);
    }

    let table = R::table();
    let mut record = probe.skeleton();
    let mut open_keys: Vec<Option<String>> = std::iter::repeat_with(|| None)
        .take(table.rules.len())
        .collect();
    let mut saw_set_line = false;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("</") {
            // End of the framed body; anything after belongs to the
            // protocol envelope, not the entity.
            break;
        }
        if line.starts_with('<') || line.starts_with('{') {
            continue;
        }
        let Some(body) = line.strip_prefix("set ") else {
            trace!("codec: skipping non-set line '{line}'");
            continue;
        };
        saw_set_line = true;
        let matched = table
            .dispatch(&mut record, body, &mut open_keys)
            .map_err(|reason| ConfigError::Validation {
                entity: probe.key(),
                reason: format!("line '{body}': {reason}"),
            })?;
        if !matched {
            trace!("codec: no rule for line '{body}'");
        }
    }

    if !saw_set_line {
        return Ok(None);
    }
    Ok(Some(record))
}

/// Renders an encoded delta the way the device would dump it back:
/// relativized to `base`, one `set` line per statement.
///
/// The bare `set <base>` creation line disappears, exactly as it does in
/// a real relative dump. Used by round-trip tests and offline tooling.
pub fn relativize(delta: &ConfigDelta, base: &str) -> String {
    let bare = format!("set {base}");
    let prefix = format!("set {base} ");
    let mut text = String::new();
    for line in delta.lines() {
        if line == &bare {
            continue;
        }
        if let Some(rest) = line.strip_prefix(&prefix) {
            text.push_str("set ");
            text.push_str(rest);
            text.push('\n');
        }
    }
    text
}
