//! Version tags for guarded code regions.
//!
//! `WorkflowCtx::get_version` records, as a lightweight step, the version
//! that was deployed the first time a labelled region was reached. During
//! replay the recorded tag comes back even if the deployed code has moved
//! on, so in-flight histories keep running the logic they were recorded
//! under, while fresh entries of the region pick up the new version.
//! Workflow code branches on the ordering:
//!
//! ```rust,ignore
//! let v = ctx.get_version("item-format", "2").await?;
//! let item = if v < VersionTag::new("2") {
//!     raw
//! } else {
//!     format!("{raw}!")
//! };
//! ```

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// A dotted version tag with numeric-aware ordering.
///
/// Segments are compared numerically when both parse as integers and
/// lexicographically otherwise, so `"1.10"` sorts above `"1.2"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionTag {
    raw: String,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum Segment<'a> {
    Number(u64),
    Text(&'a str),
}

impl VersionTag {
    /// Wrap a version string.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// The raw version string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn segments(&self) -> impl Iterator<Item = Segment<'_>> {
        self.raw
            .split('.')
            .map(|part| part.parse::<u64>().map_or(Segment::Text(part), Segment::Number))
    }
}

impl PartialEq for VersionTag {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for VersionTag {}

impl PartialOrd for VersionTag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionTag {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments().cmp(other.segments())
    }
}

impl std::fmt::Display for VersionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for VersionTag {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}
