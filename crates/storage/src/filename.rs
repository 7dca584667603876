use backfill_primitives::{BlockNumber, BlockRange};
use regex::Regex;
use std::{fmt, sync::LazyLock};

static SNAPSHOT_FILENAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)-(\d+)\.(kv|partial)$").expect("valid regex"));

/// Whether a snapshot file holds a complete store or a partial one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotKind {
    /// Complete state over `[module initial block, end)`.
    Full,
    /// Mutations over `[start, end)`.
    Partial,
}

impl SnapshotKind {
    /// File extension.
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Full => "kv",
            Self::Partial => "partial",
        }
    }
}

/// A persisted store snapshot, identified by its kind and block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotFile {
    /// Covered blocks. For complete snapshots, the start is the module initial block.
    pub range: BlockRange,
    /// Snapshot kind.
    pub kind: SnapshotKind,
}

impl SnapshotFile {
    /// Complete snapshot over `[initial_block, end)`.
    pub const fn full(initial_block: BlockNumber, end: BlockNumber) -> Option<Self> {
        match BlockRange::new(initial_block, end) {
            Some(range) => Some(Self { range, kind: SnapshotKind::Full }),
            None => None,
        }
    }

    /// Partial snapshot over `range`.
    pub const fn partial(range: BlockRange) -> Self {
        Self { range, kind: SnapshotKind::Partial }
    }

    /// Returns `true` for partial snapshots.
    pub const fn is_partial(&self) -> bool {
        matches!(self.kind, SnapshotKind::Partial)
    }

    /// Object name, `{end:010}-{start:010}.{kv|partial}`.
    pub fn filename(&self) -> String {
        format!("{:010}-{:010}.{}", self.range.end(), self.range.start(), self.kind.extension())
    }

    /// Parses an object name. Returns `None` for names that are not snapshot files.
    pub fn parse(name: &str) -> Option<Self> {
        let captures = SNAPSHOT_FILENAME.captures(name)?;
        let end = captures[1].parse().ok()?;
        let start = captures[2].parse().ok()?;
        let kind = match &captures[3] {
            "kv" => SnapshotKind::Full,
            _ => SnapshotKind::Partial,
        };
        Some(Self { range: BlockRange::new(start, end)?, kind })
    }
}

impl fmt::Display for SnapshotFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filename())
    }
}
