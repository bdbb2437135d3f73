//! Public types for the CDN engine coordinator.

/// Engine lifecycle state.
///
/// Use [`super::CdnEngine::state()`] to check the current state or
/// [`super::CdnEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Connecting to the catalog, KV service and storage units
    Connecting,
    /// Components built, background loops not started
    Ready,
    /// Accepting producers, draining queues, syncing and collecting
    Running,
    /// Listener closed, loops finishing their current pass
    ShuttingDown,
    /// Every background task has exited
    Stopped,
}

impl EngineState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Connecting => "Connecting",
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::ShuttingDown => "ShuttingDown",
            Self::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit as known to the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub id: String,
    pub name: String,
    pub created: i64,
    /// Present in the running configuration.
    pub configured: bool,
    /// Buffer unit of the running configuration.
    pub is_buffer: bool,
}

/// Outcome of a unit resync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    /// Placements checked against the backend.
    pub checked: usize,
    /// Placements dropped because their backing copy is gone.
    pub dropped: usize,
}
