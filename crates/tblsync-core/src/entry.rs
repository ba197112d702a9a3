//! Host entries, the unit of state replicated between tblsync nodes.
//!
//! An entry is keyed by its physical (link-layer) address and carries a
//! version. The version is the only thing the merge rule looks at; every
//! other attribute rides along.
//!
//! Entries arrive from peers and from the persisted table as loosely-typed
//! JSON objects. Construction is lenient about everything except the
//! physical address, which must reduce to exactly 12 hex digits.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Placeholder address. An entry constructed with it (or with no address
/// at all) gets a freshly generated one instead.
pub const PLACEHOLDER_ADDRESS: &str = "00:00:00:00:00:00";

/// Key of the table's sync-marker entry.
pub const SYNC_MARKER_ADDRESS: &str = "ff:ff:ff:ff:ff:fe";

/// Fixed, locally-administered prefix for generated addresses.
/// Generated addresses can never collide with either sentinel.
const GENERATED_PREFIX: &str = "32dbe8";

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryError {
    #[error("invalid physical address {0:?}: expected 12 hex digits")]
    InvalidPhysicalAddress(String),
    #[error("host entry attributes must be a JSON object")]
    NotAnObject,
}

// ── Physical addresses ────────────────────────────────────────────────────────

/// Normalize a physical address to `aa:bb:cc:dd:ee:ff`.
///
/// Hyphens, colons, spaces and dots are stripped and the rest is
/// lowercased. Exactly 12 hex digits must remain. Normalization is
/// idempotent.
pub fn normalize_physical_address(input: &str) -> Result<String, EntryError> {
    let digits: String = input
        .chars()
        .filter(|c| !matches!(c, '-' | ':' | ' ' | '.'))
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(EntryError::InvalidPhysicalAddress(input.to_string()));
    }
    Ok(group_octets(&digits))
}

/// Generate a random, format-valid physical address.
pub fn random_physical_address() -> String {
    let mut tail = [0u8; 3];
    rand::thread_rng().fill_bytes(&mut tail);
    group_octets(&format!("{GENERATED_PREFIX}{}", hex::encode(tail)))
}

fn group_octets(digits: &str) -> String {
    let mut out = String::with_capacity(17);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && i % 2 == 0 {
            out.push(':');
        }
        out.push(c);
    }
    out
}

// ── HostEntry ─────────────────────────────────────────────────────────────────

/// One host's attributes as replicated across the cluster.
///
/// Treat as immutable: a change is a new entry with a higher `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "HostRecord", try_from = "Value")]
pub struct HostEntry {
    /// Normalized `aa:bb:cc:dd:ee:ff` key.
    pub physical_address: String,
    pub name: String,
    pub description: String,
    pub hostname: String,
    pub ip_addresses: BTreeSet<String>,
    /// Firewall tables this host belongs to.
    pub tables: BTreeSet<String>,
    /// Conflict-resolution signal. Higher wins, ties keep the stored entry.
    pub version: i64,
    /// Absolute expiry. `None` never expires.
    pub purge_at: Option<SystemTime>,
}

impl HostEntry {
    /// Create an entry with empty attributes and version 0.
    pub fn new(physical_address: &str) -> Result<Self, EntryError> {
        Ok(Self {
            physical_address: resolve_address(Some(physical_address))?,
            name: String::new(),
            description: String::new(),
            hostname: String::new(),
            ip_addresses: BTreeSet::new(),
            tables: BTreeSet::new(),
            version: 0,
            purge_at: None,
        })
    }

    /// The table's bookkeeping entry, seeded at version -1.
    pub fn sync_marker() -> Self {
        Self {
            physical_address: SYNC_MARKER_ADDRESS.to_string(),
            name: "SYNC DB".to_string(),
            description: "SYNC DB".to_string(),
            hostname: String::new(),
            ip_addresses: BTreeSet::new(),
            tables: BTreeSet::new(),
            version: -1,
            purge_at: None,
        }
    }

    /// Build an entry from a loosely-typed attribute record.
    ///
    /// Only an unparseable `physical_address` fails. A missing or
    /// unparseable `version` becomes 0; `purge_at` is epoch seconds.
    pub fn from_attributes(attrs: &Value) -> Result<Self, EntryError> {
        let map = attrs.as_object().ok_or(EntryError::NotAnObject)?;

        let address = match map.get("physical_address") {
            None | Some(Value::Null) => None,
            Some(v) => Some(text(Some(v))),
        };

        Ok(Self {
            physical_address: resolve_address(address.as_deref())?,
            name: text(map.get("name")),
            description: text(map.get("description")),
            hostname: text(map.get("hostname")),
            ip_addresses: string_set(map.get("ip_addresses")),
            tables: string_set(map.get("tables")),
            version: loose_version(map.get("version")),
            purge_at: map.get("purge_at").and_then(Value::as_f64).and_then(from_epoch_secs),
        })
    }

    /// Plain attribute record for transport or persistence.
    pub fn to_record(&self) -> HostRecord {
        HostRecord {
            physical_address: self.physical_address.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            hostname: self.hostname.clone(),
            ip_addresses: self.ip_addresses.iter().cloned().collect(),
            tables: self.tables.iter().cloned().collect(),
            version: self.version,
            purge_at: self.purge_at.map(epoch_secs),
        }
    }

    /// The record as a JSON object, with the same keys as the serde form.
    pub fn to_attributes(&self) -> Value {
        // HostRecord has only string keys and plain values; encoding cannot fail.
        serde_json::to_value(self.to_record()).unwrap_or_default()
    }

    pub fn is_sync_marker(&self) -> bool {
        self.physical_address == SYNC_MARKER_ADDRESS
    }

    /// True if `purge_at` is set and at or before `now`.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.purge_at.is_some_and(|at| at <= now)
    }
}

impl fmt::Display for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ips: Vec<&str> = self.ip_addresses.iter().map(String::as_str).collect();
        write!(
            f,
            "{} [{}] {} v{}",
            self.name,
            self.physical_address,
            ips.join(","),
            self.version
        )
    }
}

impl TryFrom<Value> for HostEntry {
    type Error = EntryError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_attributes(&value)
    }
}

impl From<HostEntry> for HostRecord {
    fn from(entry: HostEntry) -> Self {
        entry.to_record()
    }
}

// ── HostRecord ────────────────────────────────────────────────────────────────

/// Serialized form of a [`HostEntry`]: primitive fields only.
///
/// Sets become sorted lists. `purge_at` is whole epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub physical_address: String,
    pub name: String,
    pub description: String,
    pub hostname: String,
    pub ip_addresses: Vec<String>,
    pub tables: Vec<String>,
    pub version: i64,
    pub purge_at: Option<i64>,
}

// ── Loose attribute helpers ───────────────────────────────────────────────────

fn resolve_address(input: Option<&str>) -> Result<String, EntryError> {
    let normalized = normalize_physical_address(input.unwrap_or(PLACEHOLDER_ADDRESS))?;
    if normalized == PLACEHOLDER_ADDRESS {
        Ok(random_physical_address())
    } else {
        Ok(normalized)
    }
}

fn text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn string_set(value: Option<&Value>) -> BTreeSet<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter(|v| !v.is_null())
            .map(|v| text(Some(v)))
            .collect(),
        Some(Value::String(s)) => BTreeSet::from([s.clone()]),
        _ => BTreeSet::new(),
    }
}

/// Integer-ish parse: numbers truncate, strings take their leading
/// integer prefix, anything else is 0.
fn loose_version(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => leading_integer(s.trim()),
        _ => 0,
    }
}

fn leading_integer(s: &str) -> i64 {
    let (sign, rest) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<i64>().map(|n| sign * n).unwrap_or(0)
}

fn from_epoch_secs(secs: f64) -> Option<SystemTime> {
    if !secs.is_finite() {
        return None;
    }
    let offset = Duration::try_from_secs_f64(secs.abs()).ok()?;
    if secs >= 0.0 {
        UNIX_EPOCH.checked_add(offset)
    } else {
        UNIX_EPOCH.checked_sub(offset)
    }
}

/// Whole seconds since the epoch, truncated toward zero.
pub fn epoch_secs(at: SystemTime) -> i64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}
