/*
 * Ingest Core - Configuration
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

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Selectable text-embedding profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProfile {
    Quality,
    Speed,
}

impl EmbeddingProfile {
    pub fn dimensions(self) -> usize {
        match self {
            EmbeddingProfile::Quality => 1536,
            EmbeddingProfile::Speed => 384,
        }
    }

    pub fn model_key(self) -> &'static str {
        match self {
            EmbeddingProfile::Quality => "text-embed-quality-v1",
            EmbeddingProfile::Speed => "text-embed-speed-v1",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "quality" => Ok(EmbeddingProfile::Quality),
            "speed" => Ok(EmbeddingProfile::Speed),
            other => bail!("unrecognized embedding profile {other:?}, expected 'quality' or 'speed'"),
        }
    }
}

/// Attribution tuning knobs, kept as configuration rather
/// than constants so thresholds can be tuned without a rebuild.
#[derive(Debug, Clone)]
pub struct AttributionConfig {
    pub clustering_threshold: f32,
    pub known_min_similarity: f32,
    pub attribution_margin: f32,
    pub split_threshold: f32,
    pub variance_threshold: f32,
    pub variance_range_threshold: f32,
    pub monologue_fast_path: bool,
    pub smoothing_window_s: f64,
    pub smoothing_min_run: usize,
    pub mega_cluster_threshold_s: f64,
    /// The enrolled name treated as "the primary speaker" by the
    /// per-segment fallback and the monologue fast-path (spec §4.5.5,
    /// §9). When absent, the attributor falls back to the
    /// lexicographically first enrolled name rather than arbitrary
    /// HashMap iteration order, so the choice stays deterministic.
    pub primary_speaker_name: Option<String>,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            clustering_threshold: 0.7,
            known_min_similarity: 0.62,
            attribution_margin: 0.05,
            split_threshold: 0.65,
            variance_threshold: 0.02,
            variance_range_threshold: 0.3,
            monologue_fast_path: false,
            smoothing_window_s: 60.0,
            smoothing_min_run: 3,
            mega_cluster_threshold_s: 300.0,
            primary_speaker_name: None,
        }
    }
}

/// Worker pool sizes for each stage of the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct WorkerCounts {
    pub io_workers: usize,
    pub asr_workers: usize,
    pub db_workers: usize,
}

impl Default for WorkerCounts {
    fn default() -> Self {
        Self { io_workers: 12, asr_workers: 1, db_workers: 4 }
    }
}

/// Process-wide configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub voice_profile_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub embedding_profile: EmbeddingProfile,
    pub embedding_batch_size: usize,
    pub voice_enrollment_batch_size: usize,
    pub workers: WorkerCounts,
    pub attribution: AttributionConfig,
    pub global_run_timeout: Duration,
    pub per_video_timeout: Duration,
    pub voice_embedding_cache_max_age: Duration,
    pub retain_audio: bool,
    pub embed_known_only: bool,
    pub asr_model_path: Option<PathBuf>,
    pub diarization_model_path: Option<PathBuf>,
    pub diarization_embedding_model_path: Option<PathBuf>,
    pub voice_embed_model_path: Option<PathBuf>,
    pub text_embed_model_path: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .context("DATABASE_URL environment variable not found")?;

        let voice_profile_dir = env::var("VOICE_PROFILE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./voice_profiles"));

        let temp_dir = env::var("INGEST_TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".ingest-core")
                    .join("temp")
            });
        std::fs::create_dir_all(&temp_dir)
            .with_context(|| format!("failed to create temp directory {temp_dir:?}"))?;

        let log_dir = env::var("INGEST_LOG_DIR").ok().map(PathBuf::from);

        let embedding_profile = env::var("EMBEDDING_PROFILE")
            .unwrap_or_else(|_| "quality".to_string());
        let embedding_profile = EmbeddingProfile::parse(&embedding_profile)
            .context("invalid EMBEDDING_PROFILE")?;

        let embedding_batch_size = env_parse("EMBEDDING_BATCH_SIZE", 32usize);
        let voice_enrollment_batch_size = env_parse("VOICE_ENROLLMENT_BATCH_SIZE", 8usize);

        let workers = WorkerCounts {
            io_workers: env_parse("INGEST_IO_WORKERS", 12usize),
            asr_workers: env_parse("INGEST_ASR_WORKERS", 1usize),
            db_workers: env_parse("INGEST_DB_WORKERS", 4usize),
        };

        let attribution = AttributionConfig {
            clustering_threshold: env_parse("DIARIZATION_CLUSTERING_THRESHOLD", 0.7),
            known_min_similarity: env_parse("SPEAKER_KNOWN_MIN_SIMILARITY", 0.62),
            attribution_margin: env_parse("SPEAKER_ATTRIBUTION_MARGIN", 0.05),
            split_threshold: env_parse("SPEAKER_SPLIT_THRESHOLD", 0.65),
            variance_threshold: env_parse("SPEAKER_VARIANCE_THRESHOLD", 0.02),
            variance_range_threshold: env_parse("SPEAKER_VARIANCE_RANGE_THRESHOLD", 0.3),
            monologue_fast_path: env_parse("MONOLOGUE_FAST_PATH", false),
            smoothing_window_s: env_parse("SPEAKER_SMOOTHING_WINDOW_S", 60.0),
            smoothing_min_run: env_parse("SPEAKER_SMOOTHING_MIN_RUN", 3usize),
            mega_cluster_threshold_s: env_parse("SPEAKER_MEGA_CLUSTER_THRESHOLD_S", 300.0),
            primary_speaker_name: env::var("PRIMARY_SPEAKER_NAME").ok(),
        };

        let global_run_timeout = Duration::from_secs(env_parse("INGEST_GLOBAL_TIMEOUT_S", 10 * 3600u64));
        let per_video_timeout = Duration::from_secs(env_parse("INGEST_PER_VIDEO_TIMEOUT_S", 2 * 3600u64));
        let voice_embedding_cache_max_age =
            Duration::from_secs(env_parse("VOICE_EMBEDDING_CACHE_MAX_AGE_S", 3600u64));

        let retain_audio = env_parse("INGEST_RETAIN_AUDIO", false);
        let embed_known_only = env_parse("INGEST_EMBED_KNOWN_ONLY", false);

        let asr_model_path = env::var("ASR_MODEL_PATH").ok().map(PathBuf::from);
        let diarization_model_path = env::var("DIARIZATION_MODEL_PATH").ok().map(PathBuf::from);
        let diarization_embedding_model_path = env::var("DIARIZATION_EMBEDDING_MODEL_PATH").ok().map(PathBuf::from);
        let voice_embed_model_path = env::var("VOICE_EMBED_MODEL_PATH").ok().map(PathBuf::from);
        let text_embed_model_path = env::var("TEXT_EMBED_MODEL_PATH").ok().map(PathBuf::from);

        let config = Config {
            database_url,
            voice_profile_dir,
            temp_dir,
            log_dir,
            embedding_profile,
            embedding_batch_size,
            voice_enrollment_batch_size,
            workers,
            attribution,
            global_run_timeout,
            per_video_timeout,
            voice_embedding_cache_max_age,
            retain_audio,
            embed_known_only,
            asr_model_path,
            diarization_model_path,
            diarization_embedding_model_path,
            voice_embed_model_path,
            text_embed_model_path,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            bail!("DATABASE_URL must not be empty");
        }
        if !self.voice_profile_dir.exists() {
            tracing::warn!(
                path = %self.voice_profile_dir.display(),
                "voice profile directory does not exist; ingestion will run with zero known speakers"
            );
        }
        if self.embedding_batch_size == 0 {
            bail!("EMBEDDING_BATCH_SIZE must be at least 1");
        }
        Ok(())
    }

    pub fn get_temp_file(&self, prefix: &str, extension: &str) -> PathBuf {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let filename = format!("{prefix}_{timestamp}.{extension}");
        self.temp_dir.join(filename)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse::<T>().ok()).unwrap_or(default)
}
