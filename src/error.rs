/*
 * Ingest Core - Error Taxonomy
 * Copyright (c) 2024 Ingest Core Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use thiserror::Error;

/// The taxonomy of errors the ingestion pipeline can raise.
///
/// Each per-video variant carries enough context to populate
/// `Source.last_error`; `is_fatal` tells the orchestrator whether the
/// whole run must stop or whether it should move on to the next video.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("listing sources failed: {0}")]
    Listing(#[source] anyhow::Error),

    #[error("fetch failed for source {source_id}: {kind}")]
    Fetch {
        source_id: String,
        kind: FetchErrorKind,
        #[source]
        cause: anyhow::Error,
    },

    #[error("transcription failed for source {1}: {0}")]
    Transcription(anyhow::Error, String),

    #[error("diarization failed for source {1}: {0}")]
    Diarization(anyhow::Error, String),

    #[error("speaker attribution failed for source {1}: {0}")]
    Attribution(anyhow::Error, String),

    #[error("embedding failed for source {1}: {0}")]
    Embedding(anyhow::Error, String),

    #[error("persistence failed for source {1}: {0}")]
    Persistence(anyhow::Error, String),

    #[error("configuration error: {0}")]
    Config(#[source] anyhow::Error),

    #[error("run deadline of {0:?} reached")]
    Timeout(std::time::Duration),
}

/// Sub-classification of a fetch failure, matching the fetcher's contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    RateLimited,
    BotChallenged,
    UnavailableSource,
    CorruptDownload,
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FetchErrorKind::RateLimited => "rate_limited",
            FetchErrorKind::BotChallenged => "bot_challenged",
            FetchErrorKind::UnavailableSource => "unavailable_source",
            FetchErrorKind::CorruptDownload => "corrupt_download",
        };
        write!(f, "{s}")
    }
}

impl IngestError {
    /// True if this error should abort the whole run rather than just
    /// the current video.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::Listing(_) | IngestError::Config(_) | IngestError::Timeout(_))
    }

    /// The source_id this error pertains to, if it is a per-video error.
    pub fn source_id(&self) -> Option<&str> {
        match self {
            IngestError::Fetch { source_id, .. } => Some(source_id),
            IngestError::Transcription(_, source_id) => Some(source_id),
            IngestError::Diarization(_, source_id) => Some(source_id),
            IngestError::Attribution(_, source_id) => Some(source_id),
            IngestError::Embedding(_, source_id) => Some(source_id),
            IngestError::Persistence(_, source_id) => Some(source_id),
            _ => None,
        }
    }

    /// Text suitable for storing in `Source.last_error`.
    pub fn last_error_text(&self) -> String {
        format!("{self}")
    }
}

/// Retry policy result: whether a fetch failure warrants another attempt
/// within the same session.
pub fn fetch_kind_is_retriable(kind: FetchErrorKind) -> bool {
    matches!(kind, FetchErrorKind::RateLimited | FetchErrorKind::BotChallenged)
}
