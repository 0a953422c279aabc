//! Roster sources.
//!
//! The game exposes party members through two unrelated views: the simple
//! local party list, and the cross-world aggregate that spans several
//! groups. Their records have different shapes, so a [`RosterSource`]
//! exposes both and the tracker picks one per poll based on
//! [`RosterSource::is_cross_context`].

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::Deserialize;

use super::{MemberId, MemberInfo, RosterSnapshot};
use crate::context::IdentityProvider;

/// Member record from the local party list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMemberRecord {
    /// Content id; zero for empty or not-yet-loaded slots.
    pub content_id: u64,
    /// Display name.
    pub name: String,
    /// World id.
    pub world_id: u32,
    /// Class/job id.
    pub class_job_id: u32,
    /// Level.
    pub level: u32,
}

/// Member record from the cross-world aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossMemberRecord {
    /// Content id; zero for empty slots.
    pub content_id: u64,
    /// Name as stored by the game, possibly NUL-padded.
    pub name: String,
    /// Home world id.
    pub home_world: i16,
    /// Class/job id.
    pub class_job_id: u8,
    /// Level.
    pub level: u8,
}

/// One group of the cross-world aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CrossGroup {
    /// Members of the group, in slot order.
    #[serde(default)]
    pub members: Vec<CrossMemberRecord>,
}

/// Where the roster comes from.
pub trait RosterSource: Send + Sync {
    /// `true` when the party is sourced from the cross-world aggregate.
    fn is_cross_context(&self) -> bool;

    /// Members of the local party list.
    fn local_members(&self) -> Vec<LocalMemberRecord>;

    /// Groups of the cross-world aggregate, or `None` when that view is
    /// currently unavailable.
    fn cross_groups(&self) -> Option<Vec<CrossGroup>>;
}

impl LocalMemberRecord {
    /// Normalise into a [`MemberInfo`]; `None` for the zero id.
    #[must_use]
    pub fn to_member(&self) -> Option<MemberInfo> {
        Some(MemberInfo {
            id: MemberId::new(self.content_id)?,
            name: self.name.clone(),
            world_id: self.world_id,
            class_job_id: self.class_job_id,
            level: self.level,
        })
    }
}

impl CrossMemberRecord {
    /// Normalise into a [`MemberInfo`]; `None` for the zero id.
    #[must_use]
    pub fn to_member(&self) -> Option<MemberInfo> {
        Some(MemberInfo {
            id: MemberId::new(self.content_id)?,
            name: self.name.trim_end_matches('\0').to_string(),
            world_id: u32::from(self.home_world.unsigned_abs()),
            class_job_id: u32::from(self.class_job_id),
            level: u32::from(self.level),
        })
    }
}

/// Fill `buffer` from the view selected by `cross_context`, dropping zero ids.
pub(crate) fn ingest(source: &dyn RosterSource, cross_context: bool, buffer: &mut RosterSnapshot) {
    if !cross_context {
        for member in source.local_members().iter().filter_map(LocalMemberRecord::to_member) {
            buffer.insert(member.id, member);
        }
        return;
    }

    let Some(groups) = source.cross_groups() else {
        buffer.clear();
        return;
    };

    for member in groups
        .iter()
        .flat_map(|group| group.members.iter())
        .filter_map(CrossMemberRecord::to_member)
    {
        buffer.insert(member.id, member);
    }
}

/// Raw roster size for the view selected by `cross_context`.
///
/// Counts slots as reported, without filtering zero ids.
pub(crate) fn raw_size(source: &dyn RosterSource, cross_context: bool) -> usize {
    if cross_context {
        source
            .cross_groups()
            .map_or(0, |groups| groups.iter().map(|g| g.members.len()).sum())
    } else {
        source.local_members().len()
    }
}

/// Errors reading a roster document.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// File could not be read.
    #[error("failed to read roster file {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// File contents are not a valid roster document.
    #[error("failed to parse roster file {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// On-disk roster document read by [`FileRosterSource`].
///
/// ```json
/// {
///   "identity": 4242,
///   "crossContext": false,
///   "local": [{ "contentId": 1, "name": "A", "worldId": 73, "classJobId": 19, "level": 100 }],
///   "crossGroups": [{ "members": [] }]
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterDocument {
    /// Local identity; zero or absent means logged out.
    #[serde(default)]
    pub identity: u64,
    /// Whether the cross-world aggregate is active.
    #[serde(default)]
    pub cross_context: bool,
    /// Local party list.
    #[serde(default)]
    pub local: Vec<LocalMemberRecord>,
    /// Cross-world groups; absent when the aggregate is unavailable.
    #[serde(default)]
    pub cross_groups: Option<Vec<CrossGroup>>,
}

impl RosterDocument {
    /// Parse a document from JSON text.
    pub fn from_json(path: &Path, text: &str) -> Result<Self, SourceError> {
        serde_json::from_str(text).map_err(|source| SourceError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Roster source backed by a JSON file that is re-read on every query.
///
/// Lets a headless host (or a test) drive the tracker by rewriting the file.
/// A failing file is reported once per distinct error, not on every read.
#[derive(Debug)]
pub struct FileRosterSource {
    path: PathBuf,
    last_error: Mutex<Option<String>>,
}

impl FileRosterSource {
    /// Source reading from `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_error: Mutex::new(None),
        }
    }

    /// Path being read.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the document.
    pub fn read(&self) -> Result<RosterDocument, SourceError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| SourceError::Io {
            path: self.path.clone(),
            source,
        })?;
        RosterDocument::from_json(&self.path, &text)
    }

    /// Most recent read failure, cleared by the next successful read.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Read the document, treating any failure as an empty logged-out roster.
    fn document(&self) -> RosterDocument {
        match self.read() {
            Ok(document) => {
                if self.record(None) {
                    log::info!("[Roster] {} is readable again", self.path.display());
                }
                document
            }
            Err(e) => {
                let message = e.to_string();
                if self.record(Some(message.clone())) {
                    log::warn!("[Roster] {message}");
                } else {
                    log::trace!("[Roster] {message}");
                }
                RosterDocument::default()
            }
        }
    }

    /// Store the read outcome; `true` when it differs from the previous one.
    fn record(&self, error: Option<String>) -> bool {
        let mut last = self.last_error.lock().unwrap_or_else(PoisonError::into_inner);
        if *last == error {
            return false;
        }
        *last = error;
        true
    }
}

impl RosterSource for FileRosterSource {
    fn is_cross_context(&self) -> bool {
        self.document().cross_context
    }

    fn local_members(&self) -> Vec<LocalMemberRecord> {
        self.document().local
    }

    fn cross_groups(&self) -> Option<Vec<CrossGroup>> {
        self.document().cross_groups
    }
}

impl IdentityProvider for FileRosterSource {
    fn identity(&self) -> Option<u64> {
        match self.document().identity {
            0 => None,
            id => Some(id),
        }
    }
}
