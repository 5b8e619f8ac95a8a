use serde::{Deserialize, Serialize};

/// File suffix used by cross-process lock markers.
pub const LOCK_SUFFIX: &str = "lock";

/// Lifecycle stage of a staged resource.
///
/// A file-backed resource lives at `{path}.{suffix}`, so a directory scan
/// shows which stage every artifact reached. Moving between stages is a
/// rename, never an in-memory flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Being written by a producer.
    Creating,
    /// Reserved intermediate stage. Nothing drives a resource into it.
    Ready,
    /// Fully written and safe to consume.
    Done,
}

impl ResourceState {
    pub const ALL: [ResourceState; 3] = [
        ResourceState::Creating,
        ResourceState::Ready,
        ResourceState::Done,
    ];

    /// The file name suffix for this stage.
    pub const fn suffix(self) -> &'static str {
        match self {
            ResourceState::Creating => "creating",
            ResourceState::Ready => "ready",
            ResourceState::Done => "done",
        }
    }

    /// Map a file name suffix back to its stage.
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.suffix() == suffix)
    }

    /// Whether this is the terminal stage.
    pub const fn is_terminal(self) -> bool {
        matches!(self, ResourceState::Done)
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}
