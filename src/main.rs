/*
 * Ingest Core - CLI Entry Point
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

mod asr;
mod attributor;
mod config;
mod diarizer;
mod error;
mod fetcher;
mod gpu;
mod lister;
mod logging;
mod orchestrator;
mod persistence;
mod text_embedder;
mod types;
mod voice_profiles;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::asr::{AsrConfig, AsrEngine};
use crate::config::{Config, EmbeddingProfile};
use crate::fetcher::{AudioFetcher, FetchCredentials};
use crate::lister::{ListingFilters, SourceLister, SourceSelector};
use crate::orchestrator::{ComputeHandles, Orchestrator, StopReason};
use crate::persistence::PersistenceWriter;
use crate::voice_profiles::VoiceProfileStore;

/// Ingests long-form interview/podcast audio: fetch, transcribe,
/// diarize, attribute speaker identity, embed, and persist.
#[derive(Parser, Debug)]
#[command(name = "ingest", version, about)]
struct Cli {
    /// A channel handle (e.g. "@some-show"), a JSON manifest path, or one
    /// or more explicit video ids, depending on which flag selects it.
    #[arg(value_name = "SOURCE")]
    source: Option<String>,

    /// Treat SOURCE as a path to a JSON manifest of {id, title, channel, published_at}.
    #[arg(long, conflicts_with = "ids")]
    manifest: bool,

    /// Treat the positional arguments as explicit video ids, comma-separated.
    #[arg(long)]
    ids: Option<String>,

    /// Only ingest videos published within the last N days.
    #[arg(long)]
    days_back: Option<u32>,

    /// Cap the number of videos ingested this run.
    #[arg(long)]
    limit: Option<usize>,

    /// Order candidates newest-published-first.
    #[arg(long)]
    newest_first: bool,

    /// Re-ingest and overwrite sources already marked done.
    #[arg(long)]
    force: bool,

    /// Skip sources already marked done (default listing behavior; explicit for clarity).
    #[arg(long)]
    skip_existing: bool,

    /// Override the global run deadline, e.g. "8h", "30m". Plain integers are seconds.
    #[arg(long)]
    max_runtime: Option<String>,

    /// Text embedding profile: "quality" (default, higher dimensional) or "speed".
    #[arg(long)]
    embedding_profile: Option<String>,

    /// Only embed segments attributed to a known speaker.
    #[arg(long)]
    embed_known_only: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return ExitCode::from(1);
        }
    };

    let _log_guard = match logging::init(config.log_dir.as_ref()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialize logging: {err:#}");
            return ExitCode::from(1);
        }
    };

    if let Some(profile) = &cli.embedding_profile {
        match profile.as_str() {
            "quality" => config.embedding_profile = EmbeddingProfile::Quality,
            "speed" => config.embedding_profile = EmbeddingProfile::Speed,
            other => {
                tracing::error!(profile = other, "unrecognized --embedding-profile");
                return ExitCode::from(1);
            }
        }
    }
    if cli.embed_known_only {
        config.embed_known_only = true;
    }
    if let Some(max_runtime) = &cli.max_runtime {
        match parse_duration(max_runtime) {
            Ok(d) => config.global_run_timeout = d,
            Err(err) => {
                tracing::error!(value = %max_runtime, error = %err, "invalid --max-runtime");
                return ExitCode::from(1);
            }
        }
    }

    match run(cli, config).await {
        Ok(StopReason::Completed) => ExitCode::from(0),
        Ok(StopReason::GlobalTimeout) => ExitCode::from(124),
        Ok(StopReason::Interrupted) => ExitCode::from(130),
        Err(err) => {
            tracing::error!(error = %err, "ingestion run failed");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<StopReason> {
    let persistence = Arc::new(PersistenceWriter::connect(&config.database_url, config.workers.db_workers as u32 + 2).await?);
    persistence.ensure_schema().await?;

    let selector = resolve_selector(&cli)?;
    let filters = ListingFilters {
        days_back: cli.days_back,
        skip_existing: cli.skip_existing || !cli.force,
        force: cli.force,
        limit: cli.limit,
        newest_first: cli.newest_first,
    };

    let lister = SourceLister::new(&persistence);
    let candidates = lister.list(&selector, &filters).await?;
    if candidates.is_empty() {
        tracing::info!("no candidate sources to ingest");
        return Ok(StopReason::Completed);
    }

    let voice_profiles = Arc::new(VoiceProfileStore::load(&config.voice_profile_dir)?);
    let fetcher = Arc::new(AudioFetcher::new(&config, FetchCredentials::default()));
    let compute = Arc::new(build_compute_handles(&config, voice_profiles)?);

    let orchestrator = Orchestrator::new(config.clone(), persistence, fetcher, compute, cli.force, config.embed_known_only);
    let outcome = orchestrator.run(candidates).await;

    tracing::info!(
        done = outcome.sources_done,
        errored = outcome.sources_errored,
        stopped_reason = ?outcome.stopped_reason,
        "ingestion run finished"
    );

    Ok(outcome.stopped_reason)
}

fn resolve_selector(cli: &Cli) -> anyhow::Result<SourceSelector> {
    if let Some(ids) = &cli.ids {
        let ids: Vec<String> = ids.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        anyhow::ensure!(!ids.is_empty(), "--ids given but no non-empty ids found");
        return Ok(SourceSelector::ExplicitIds(ids));
    }

    let source = cli.source.as_deref().ok_or_else(|| anyhow::anyhow!("a SOURCE argument is required"))?;
    if cli.manifest {
        Ok(SourceSelector::Manifest(std::path::PathBuf::from(source)))
    } else {
        Ok(SourceSelector::ChannelHandle(source.to_string()))
    }
}

#[cfg(feature = "onnx-runtime")]
fn build_compute_handles(config: &Config, voice_profiles: Arc<VoiceProfileStore>) -> anyhow::Result<ComputeHandles> {
    use crate::attributor::{CachingVoiceEmbedder, OnnxVoiceEmbedder};
    use crate::diarizer::OnnxDiarizer;
    use crate::text_embedder::OnnxTextEmbedder;

    let asr_model_path = config
        .asr_model_path
        .clone()
        .ok_or_else(|| anyhow::anyhow!("ASR_MODEL_PATH must be set when the onnx-runtime feature is enabled"))?;
    let diarization_model_path = config
        .diarization_model_path
        .clone()
        .ok_or_else(|| anyhow::anyhow!("DIARIZATION_MODEL_PATH must be set when the onnx-runtime feature is enabled"))?;
    let diarization_embedding_model_path = config
        .diarization_embedding_model_path
        .clone()
        .ok_or_else(|| anyhow::anyhow!("DIARIZATION_EMBEDDING_MODEL_PATH must be set when the onnx-runtime feature is enabled"))?;
    let voice_embed_model_path = config
        .voice_embed_model_path
        .clone()
        .ok_or_else(|| anyhow::anyhow!("VOICE_EMBED_MODEL_PATH must be set when the onnx-runtime feature is enabled"))?;
    let text_embed_model_path = config
        .text_embed_model_path
        .clone()
        .ok_or_else(|| anyhow::anyhow!("TEXT_EMBED_MODEL_PATH must be set when the onnx-runtime feature is enabled"))?;

    let asr = crate::asr::OnnxAsrEngine::load(AsrConfig { model_path: asr_model_path, ..AsrConfig::default() })?;
    let diarizer = OnnxDiarizer::load(&diarization_model_path, &diarization_embedding_model_path)?;
    let voice_embedder: Arc<dyn crate::attributor::VoiceEmbedder> = Arc::new(OnnxVoiceEmbedder::load(&voice_embed_model_path)?);
    let voice_embedder = CachingVoiceEmbedder::new(
        voice_embedder,
        config.temp_dir.join("voice_embed_cache.bin"),
        config.voice_embedding_cache_max_age,
    )?;
    let text_embedder = OnnxTextEmbedder::load(&text_embed_model_path, config.embedding_profile)?;

    Ok(ComputeHandles {
        voice_profiles,
        asr: Arc::new(asr) as Arc<dyn AsrEngine>,
        diarizer: Arc::new(diarizer) as Arc<dyn crate::diarizer::Diarizer>,
        voice_embedder: Arc::new(voice_embedder) as Arc<dyn crate::attributor::VoiceEmbedder>,
        text_embedder: Arc::new(text_embedder) as Arc<dyn crate::text_embedder::TextEmbedder>,
        gpu: crate::gpu::GpuLock::new(),
    })
}

#[cfg(not(feature = "onnx-runtime"))]
fn build_compute_handles(_config: &Config, _voice_profiles: Arc<VoiceProfileStore>) -> anyhow::Result<ComputeHandles> {
    anyhow::bail!("no compute backend compiled in; enable the `onnx-runtime` or `whisper-asr` feature")
}

/// Parses a human-entered duration like "8h", "30m", "45s", or a bare
/// integer (seconds), for `--max-runtime`.
fn parse_duration(input: &str) -> anyhow::Result<Duration> {
    let input = input.trim();
    if let Ok(seconds) = input.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }
    let (number, unit) = input.split_at(input.len() - 1);
    let value: u64 = number.parse().map_err(|_| anyhow::anyhow!("cannot parse duration {input:?}"))?;
    match unit {
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        "d" => Ok(Duration::from_secs(value * 86400)),
        other => anyhow::bail!("unrecognized duration unit {other:?} in {input:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_accepts_bare_seconds_and_suffixed_units() {
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("8h").unwrap(), Duration::from_secs(28800));
    }

    #[test]
    fn parse_duration_rejects_unknown_units() {
        assert!(parse_duration("5x").is_err());
    }
}
