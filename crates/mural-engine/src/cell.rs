//! Cell records, versions, and the row shape shared with the store and bus.

use mural_grid::Cell;
use serde::{Deserialize, Serialize};

/// Write version for last-writer-wins ordering.
///
/// Ordered by wall-clock timestamp first, with a per-writer sequence
/// number breaking ties between writes the same session issued within one
/// millisecond. Two records with equal versions are treated as the same
/// write (replay), never as a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Per-writer sequence number.
    pub seq: u64,
}

impl Version {
    /// Create a version from a timestamp and writer sequence.
    pub const fn new(timestamp_ms: u64, seq: u64) -> Self {
        Self { timestamp_ms, seq }
    }
}

/// Color of a cell.
///
/// Erasure is a first-class value, not an absence: a tombstone carries a
/// version and can itself lose a last-writer-wins race against a newer
/// paint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellColor {
    /// A painted RGB color.
    Rgb(u8, u8, u8),
    /// The erased marker.
    Erased,
}

impl CellColor {
    /// Parse a `#RRGGBB` hex string.
    pub fn parse(s: &str) -> Option<Self> {
        let hex = s.strip_prefix('#')?;
        if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
        let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
        let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
        Some(Self::Rgb(r, g, b))
    }

    /// Hex form for the wire/store row; `None` for the erased marker.
    pub fn to_hex(&self) -> Option<String> {
        match self {
            Self::Rgb(r, g, b) => Some(format!("#{r:02X}{g:02X}{b:02X}")),
            Self::Erased => None,
        }
    }

    /// Whether this is the erased marker.
    pub const fn is_erased(&self) -> bool {
        matches!(self, Self::Erased)
    }
}

/// Identity of the session that wrote a cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    /// Stable user identifier.
    pub id: String,
    /// Display name shown next to painted cells.
    pub name: String,
    /// Optional avatar reference.
    pub avatar: Option<String>,
}

/// Distinguished id shared by all unauthenticated sessions.
pub const ANONYMOUS_ID: &str = "anonymous";

impl Owner {
    /// Create an owner.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
        }
    }

    /// The unauthenticated writer identity.
    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS_ID, "Anonymous")
    }

    /// Whether this is the unauthenticated identity.
    pub fn is_anonymous(&self) -> bool {
        self.id == ANONYMOUS_ID
    }
}

/// The live state of one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellRecord {
    /// Current color, or the erased tombstone.
    pub color: CellColor,
    /// Who wrote it.
    pub owner: Owner,
    /// Write version for conflict resolution.
    pub version: Version,
}

impl CellRecord {
    /// Create a record.
    pub fn new(color: CellColor, owner: Owner, version: Version) -> Self {
        Self {
            color,
            owner,
            version,
        }
    }

    /// Check if this record is strictly newer than another.
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.version > other.version
    }
}

/// Row shape carried by the store and the change bus.
///
/// `color = None` means erased. Both erasure representations seen in the
/// wild must be handled: a delete event, and an upsert whose color is
/// null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRow {
    pub x: u32,
    pub y: u32,
    pub color: Option<String>,
    pub owner_id: String,
    pub owner_name: String,
    pub owner_avatar: Option<String>,
    pub ts: u64,
    pub seq: u64,
}

impl CellRow {
    /// Build a row from a cell record.
    pub fn from_record(cell: Cell, record: &CellRecord) -> Self {
        Self {
            x: cell.x,
            y: cell.y,
            color: record.color.to_hex(),
            owner_id: record.owner.id.clone(),
            owner_name: record.owner.name.clone(),
            owner_avatar: record.owner.avatar.clone(),
            ts: record.version.timestamp_ms,
            seq: record.version.seq,
        }
    }

    /// The cell this row addresses (saturated to the grid).
    pub fn cell(&self) -> Cell {
        Cell::new(self.x, self.y)
    }

    /// The row's write version.
    pub const fn version(&self) -> Version {
        Version::new(self.ts, self.seq)
    }

    /// Convert to a cache record.
    ///
    /// `None` color is the erased tombstone. A malformed color string
    /// yields `None`; the caller decides whether to log and skip.
    pub fn to_record(&self) -> Option<CellRecord> {
        let color = match &self.color {
            Some(hex) => CellColor::parse(hex)?,
            None => CellColor::Erased,
        };
        Some(CellRecord {
            color,
            owner: Owner {
                id: self.owner_id.clone(),
                name: self.owner_name.clone(),
                avatar: self.owner_avatar.clone(),
            },
            version: self.version(),
        })
    }

    /// A tombstone record carrying this row's owner and version.
    ///
    /// Used when the row arrived on a delete event: the payload's color is
    /// irrelevant, the deletion itself is the value.
    pub fn to_tombstone(&self) -> CellRecord {
        CellRecord {
            color: CellColor::Erased,
            owner: Owner {
                id: self.owner_id.clone(),
                name: self.owner_name.clone(),
                avatar: self.owner_avatar.clone(),
            },
            version: self.version(),
        }
    }
}
