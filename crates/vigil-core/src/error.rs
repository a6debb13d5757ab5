//! Typed error hierarchy for the pipeline.
//!
//! Uses `thiserror` for library-grade errors.  The binary maps every variant
//! to a process exit code via [`VigilError::error_code`].
//!
//! # Error codes
//!
//! Codes are grouped by phase so scripts can branch on them without parsing
//! messages:
//! - 1x: graph construction (stage creation, static links, pad requests)
//! - 2x: configuration
//! - 3x: runtime (bus errors, failed dynamic links)
//! - 4x: backend and plumbing

use crate::backend::StageKind;

/// All errors originating from graph construction or a running pipeline.
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    // ── Construction ─────────────────────────────────────────────────
    #[error("Unable to create {name} ({kind}): {reason}")]
    StageCreation {
        kind: StageKind,
        name: String,
        reason: String,
    },

    #[error("Unable to link {from} -> {to}: {reason}")]
    StaticLink {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Unable to get the {pad} pad of {stage}")]
    PadRequest { stage: String, pad: String },

    #[error("Unable to set property {key} on {stage}: {reason}")]
    Property {
        stage: String,
        key: String,
        reason: String,
    },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("Tracker config {path}: {reason}")]
    TrackerConfig { path: String, reason: String },

    // ── Runtime ──────────────────────────────────────────────────────
    #[error("Failed to link new demux pad {demuxer}.{pad} -> {target}")]
    DynamicLink {
        demuxer: String,
        pad: String,
        target: String,
    },

    #[error("Error from {stage}: {message}")]
    Runtime {
        stage: String,
        message: String,
        debug: Option<String>,
    },

    // ── Backend / plumbing ───────────────────────────────────────────
    #[error("Stage backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pipeline event channel closed unexpectedly")]
    ChannelClosed,
}

impl VigilError {
    /// Stable integer error code, used as the process exit status.
    pub fn error_code(&self) -> u8 {
        match self {
            Self::StageCreation { .. } => 10,
            Self::StaticLink { .. } => 11,
            Self::PadRequest { .. } => 12,
            Self::Property { .. } => 13,
            Self::InvalidConfig(_) => 20,
            Self::TrackerConfig { .. } => 21,
            Self::DynamicLink { .. } => 30,
            Self::Runtime { .. } => 31,
            Self::Backend(_) => 40,
            Self::Io(_) => 41,
            Self::ChannelClosed => 42,
        }
    }

    /// Whether the error can only arise before the graph starts playing.
    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            Self::StageCreation { .. }
                | Self::StaticLink { .. }
                | Self::PadRequest { .. }
                | Self::Property { .. }
                | Self::InvalidConfig(_)
                | Self::TrackerConfig { .. }
        )
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, VigilError>;
