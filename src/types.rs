/*
 * Ingest Core - Data Model
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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ingestion status of a Source row.
///
/// Persisted as plain `text`; sqlx binds/reads it via `as_str`/`parse`
/// rather than a generated `sqlx::Type` impl, since the column is a bare
/// TEXT rather than a Postgres enum type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Pending => "pending",
            IngestStatus::Running => "running",
            IngestStatus::Done => "done",
            IngestStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for IngestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for IngestStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(IngestStatus::Pending),
            "running" => Ok(IngestStatus::Running),
            "done" => Ok(IngestStatus::Done),
            "error" => Ok(IngestStatus::Error),
            other => anyhow::bail!("unrecognized ingest_status {other:?}"),
        }
    }
}

/// One ingestable video, identified by an opaque platform id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub source_id: String,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub channel: String,
    pub ingest_status: IngestStatus,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Source {
    pub fn pending(source_id: impl Into<String>, title: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            title: title.into(),
            published_at: None,
            duration_seconds: None,
            channel: channel.into(),
            ingest_status: IngestStatus::Pending,
            last_error: None,
            processed_at: None,
        }
    }
}

/// A speaker attribution for one segment, encoded as a tagged variant
/// rather than a raw string, so downstream matches stay exhaustive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SpeakerLabel {
    Known(String),
    Guest,
    Unknown,
}

impl SpeakerLabel {
    /// Discriminator column value, persisted alongside the name.
    pub fn discriminator(&self) -> &'static str {
        match self {
            SpeakerLabel::Known(_) => "known",
            SpeakerLabel::Guest => "guest",
            SpeakerLabel::Unknown => "unknown",
        }
    }

    /// The enrolled name, if this is a known-speaker label.
    pub fn name(&self) -> Option<&str> {
        match self {
            SpeakerLabel::Known(name) => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, SpeakerLabel::Known(_))
    }
}

/// A contiguous span of speech within a source, attributed to a single speaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub segment_id: Uuid,
    pub source_id: String,
    pub ordinal: i32,
    pub start_s: f64,
    pub end_s: f64,
    pub text: String,
    pub speaker_label: SpeakerLabel,
    pub speaker_confidence: Option<f32>,
    pub voice_embedding: Option<Vec<f32>>,
    pub asr_confidence: Option<f32>,
}

impl Segment {
    pub fn duration(&self) -> f64 {
        self.end_s - self.start_s
    }
}

/// A text embedding for one segment under a specific model key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextEmbeddingRow {
    pub segment_id: Uuid,
    pub model_key: String,
    pub dimensions: i32,
    pub vector: Vec<f32>,
}

/// A known speaker's stored voice centroid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub name: String,
    pub centroid: Vec<f32>,
    pub threshold: f32,
    pub created_at: DateTime<Utc>,
}

/// On-disk shape accepted for a voice profile file; the legacy
/// `embeddings` form is compressed to a centroid at load time.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VoiceProfileFile {
    Centroid {
        name: String,
        centroid: Vec<f32>,
        threshold: f32,
        #[serde(default = "Utc::now")]
        created_at: DateTime<Utc>,
    },
    Legacy {
        name: String,
        embeddings: Vec<Vec<f32>>,
        threshold: f32,
    },
}

/// A word with timestamps and a per-word confidence, output by the ASR engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Word {
    pub t_start: f64,
    pub t_end: f64,
    pub text: String,
    pub confidence: f32,
}

/// An ASR-produced grouping of words, before turn-boundary splitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSegment {
    pub t_start: f64,
    pub t_end: f64,
    pub text: String,
    pub words: Vec<Word>,
}

/// Full ASR transcription output for one video.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub words: Vec<Word>,
    pub raw_segments: Vec<RawSegment>,
}

/// A contiguous span attributed to one diarization cluster, with no identity yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub t_start: f64,
    pub t_end: f64,
    pub cluster_id: String,
}

/// A fetched, validated, converted audio artifact ready for ASR.
#[derive(Debug, Clone)]
pub struct AudioArtifact {
    pub path: std::path::PathBuf,
    pub duration_s: f64,
    pub sample_rate: u32,
}

/// A speaker-coherent segment, tagged with a cluster id, produced by
/// Phase B segment splitting, prior to identity assignment.
#[derive(Debug, Clone)]
pub struct ClusterSegment {
    pub ordinal: i32,
    pub start_s: f64,
    pub end_s: f64,
    pub text: String,
    pub cluster_id: String,
    pub asr_confidence: Option<f32>,
}

/// The terminal outcome of classifying one diarized cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterOutcome {
    LabeledKnown { name: String, similarity: f32 },
    LabeledGuest { similarity: f32 },
    PerSegmentLabeled,
}
