/*
 * Ingest Core - Pipeline Orchestrator
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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::asr::AsrEngine;
use crate::attributor::{SpeakerAttributor, VoiceEmbedder};
use crate::config::Config;
use crate::diarizer::{DiarizationConfig, Diarizer, FALLBACK_CLUSTER_ID};
use crate::error::IngestError;
use crate::fetcher::AudioFetcher;
use crate::lister::SourceDescriptor;
use crate::persistence::{is_eligible_for_embedding, PersistenceWriter};
use crate::text_embedder::TextEmbedder;
use crate::types::{Source, TextEmbeddingRow, Turn};
use crate::voice_profiles::VoiceProfileStore;

const COMPUTE_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const IO_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(15);
const QUEUE_CAPACITY: usize = 4;

/// The long-lived handles a compute task needs; bundled so the
/// orchestrator can pass one `Arc` into each spawned worker instead of
/// threading five separate arguments through.
pub struct ComputeHandles {
    pub voice_profiles: Arc<VoiceProfileStore>,
    pub asr: Arc<dyn AsrEngine>,
    pub diarizer: Arc<dyn Diarizer>,
    pub voice_embedder: Arc<dyn VoiceEmbedder>,
    pub text_embedder: Arc<dyn TextEmbedder>,
    pub gpu: crate::gpu::GpuLock,
}

#[derive(Default)]
pub struct ProgressCounters {
    listed: AtomicU64,
    fetched: AtomicU64,
    transcribed: AtomicU64,
    attributed: AtomicU64,
    embedded: AtomicU64,
    committed: AtomicU64,
    errored: AtomicU64,
}

/// Wires the Source Lister, Audio Fetcher, compute stages, and
/// Persistence Writer together behind bounded queues.
pub struct Orchestrator {
    config: Config,
    persistence: Arc<PersistenceWriter>,
    fetcher: Arc<AudioFetcher>,
    compute: Arc<ComputeHandles>,
    force: bool,
    embed_known_only: bool,
    progress: Arc<ProgressCounters>,
}

pub struct RunOutcome {
    pub sources_done: u64,
    pub sources_errored: u64,
    pub stopped_reason: StopReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    GlobalTimeout,
    Interrupted,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        persistence: Arc<PersistenceWriter>,
        fetcher: Arc<AudioFetcher>,
        compute: Arc<ComputeHandles>,
        force: bool,
        embed_known_only: bool,
    ) -> Self {
        Self { config, persistence, fetcher, compute, force, embed_known_only, progress: Arc::new(ProgressCounters::default()) }
    }

    /// Runs the full pipeline over `candidates` until they are all
    /// drained, the global deadline is hit, or a shutdown signal arrives.
    pub async fn run(&self, candidates: Vec<SourceDescriptor>) -> RunOutcome {
        let shutdown = CancellationToken::new();
        let run_start = Instant::now();
        let deadline = run_start + self.config.global_run_timeout;

        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            tracing::warn!("shutdown signal received, draining in-flight videos");
            signal_token.cancel();
        });

        let (id_tx, id_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (audio_tx, audio_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (batch_tx, batch_rx) = mpsc::channel(QUEUE_CAPACITY);

        let listed = self.progress.clone();
        let feed_shutdown = shutdown.clone();
        let feeder = tokio::spawn(async move {
            for candidate in candidates {
                if feed_shutdown.is_cancelled() {
                    break;
                }
                listed.listed.fetch_add(1, Ordering::Relaxed);
                if id_tx.send(candidate).await.is_err() {
                    break;
                }
            }
        });

        let audio_rx = Arc::new(Mutex::new(audio_rx));
        let id_rx = Arc::new(Mutex::new(id_rx));
        let batch_rx = Arc::new(Mutex::new(batch_rx));

        let mut fetcher_handles = Vec::new();
        for _ in 0..self.config.workers.io_workers.max(1) {
            fetcher_handles.push(self.spawn_fetcher(id_rx.clone(), audio_tx.clone(), shutdown.clone()));
        }
        drop(audio_tx);

        let mut compute_handles = Vec::new();
        for _ in 0..self.config.workers.asr_workers.max(1) {
            compute_handles.push(self.spawn_compute(audio_rx.clone(), batch_tx.clone(), shutdown.clone()));
        }
        drop(batch_tx);

        let mut writer_handles = Vec::new();
        for _ in 0..self.config.workers.db_workers.max(1) {
            writer_handles.push(self.spawn_writer(batch_rx.clone(), shutdown.clone()));
        }

        let progress_reporter = {
            let progress = self.progress.clone();
            let reporter_shutdown = shutdown.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                loop {
                    tokio::select! {
                        _ = sleep(PROGRESS_INTERVAL) => {}
                        _ = reporter_shutdown.cancelled() => break,
                    }
                    progress.log(start.elapsed());
                }
            })
        };

        let stop_reason = tokio::select! {
            _ = async {
                let _ = feeder.await;
                join_all(fetcher_handles).await;
                join_all(compute_handles).await;
                join_all(writer_handles).await;
            } => {
                if shutdown.is_cancelled() { StopReason::Interrupted } else { StopReason::Completed }
            }
            _ = tokio::time::sleep_until(deadline.into()) => {
                tracing::error!("global run deadline reached, initiating graceful drain");
                shutdown.cancel();
                sleep(COMPUTE_SHUTDOWN_GRACE).await;
                StopReason::GlobalTimeout
            }
        };

        progress_reporter.abort();
        self.progress.log(run_start.elapsed());

        RunOutcome {
            sources_done: self.progress.committed.load(Ordering::Relaxed),
            sources_errored: self.progress.errored.load(Ordering::Relaxed),
            stopped_reason: stop_reason,
        }
    }

    fn spawn_fetcher(
        &self,
        id_rx: Arc<Mutex<mpsc::Receiver<SourceDescriptor>>>,
        audio_tx: mpsc::Sender<(SourceDescriptor, crate::types::AudioArtifact)>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let fetcher = self.fetcher.clone();
        let persistence = self.persistence.clone();
        let progress = self.progress.clone();

        tokio::spawn(async move {
            loop {
                let candidate = {
                    let mut rx = id_rx.lock().await;
                    tokio::select! {
                        item = rx.recv() => item,
                        _ = shutdown.cancelled() => None,
                    }
                };
                let Some(candidate) = candidate else { break };

                let source = Source::pending(candidate.source_id.clone(), candidate.title.clone(), candidate.channel.clone());
                if let Err(err) = persistence.mark_running(&source).await {
                    tracing::error!(source_id = %candidate.source_id, error = %err, "failed to mark source running");
                    progress.errored.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                match fetcher.fetch(&candidate.source_id).await {
                    Ok(artifact) => {
                        progress.fetched.fetch_add(1, Ordering::Relaxed);
                        if audio_tx.send((candidate, artifact)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(source_id = %candidate.source_id, error = %err, "fetch failed; video marked error");
                        persistence.mark_error(&candidate.source_id, &err.last_error_text()).await.ok();
                        progress.errored.fetch_add(1, Ordering::Relaxed);
                    }
                }

                if shutdown.is_cancelled() {
                    sleep(IO_SHUTDOWN_GRACE).await;
                    break;
                }
            }
        })
    }

    fn spawn_compute(
        &self,
        audio_rx: Arc<Mutex<mpsc::Receiver<(SourceDescriptor, crate::types::AudioArtifact)>>>,
        batch_tx: mpsc::Sender<VideoBatch>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let compute = self.compute.clone();
        let persistence = self.persistence.clone();
        let progress = self.progress.clone();
        let attribution_config = self.config.attribution.clone();
        let per_video_timeout = self.config.per_video_timeout;
        let embedding_batch_size = self.config.embedding_batch_size;
        let retain_audio = self.config.retain_audio;
        let embed_known_only = self.embed_known_only;

        tokio::spawn(async move {
            loop {
                let item = {
                    let mut rx = audio_rx.lock().await;
                    rx.recv().await
                };
                let Some((candidate, audio)) = item else { break };

                let outcome = tokio::time::timeout(
                    per_video_timeout,
                    process_one_video(&compute, &attribution_config, &candidate, &audio, embedding_batch_size, embed_known_only),
                )
                .await;

                match outcome {
                    Ok(Ok(batch)) => {
                        progress.transcribed.fetch_add(1, Ordering::Relaxed);
                        progress.attributed.fetch_add(1, Ordering::Relaxed);
                        progress.embedded.fetch_add(1, Ordering::Relaxed);
                        if batch_tx.send(batch).await.is_err() {
                            break;
                        }
                    }
                    Ok(Err(err)) => {
                        tracing::warn!(source_id = %candidate.source_id, error = %err, "compute stage failed; video marked error");
                        persistence.mark_error(&candidate.source_id, &err.last_error_text()).await.ok();
                        progress.errored.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        tracing::warn!(source_id = %candidate.source_id, "per-video deadline exceeded");
                        persistence.mark_error(&candidate.source_id, "per-video deadline exceeded").await.ok();
                        progress.errored.fetch_add(1, Ordering::Relaxed);
                    }
                }

                if !retain_audio {
                    let _ = std::fs::remove_file(&audio.path);
                }

                if shutdown.is_cancelled() {
                    sleep(COMPUTE_SHUTDOWN_GRACE).await;
                    break;
                }
            }
        })
    }

    fn spawn_writer(
        &self,
        batch_rx: Arc<Mutex<mpsc::Receiver<VideoBatch>>>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let persistence = self.persistence.clone();
        let progress = self.progress.clone();
        let force = self.force;

        tokio::spawn(async move {
            loop {
                let item = {
                    let mut rx = batch_rx.lock().await;
                    rx.recv().await
                };
                let Some(batch) = item else { break };

                match persistence
                    .commit_video(&batch.source_id, batch.duration_s, &batch.segments, &batch.embeddings, force)
                    .await
                {
                    Ok(()) => {
                        progress.committed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        tracing::error!(source_id = %batch.source_id, error = %err, "persistence failed for video");
                        progress.errored.fetch_add(1, Ordering::Relaxed);
                    }
                }

                if shutdown.is_cancelled() {
                    break;
                }
            }
        })
    }
}

struct VideoBatch {
    source_id: String,
    duration_s: f64,
    segments: Vec<crate::types::Segment>,
    embeddings: Vec<TextEmbeddingRow>,
}

/// Runs ASR -> diarize -> attribute -> embed for one video, end to end,
/// within a single GPU-lock acquisition per stage. Stage ordering within
/// one source_id is strict; this function's sequential `.await`
/// chain is exactly that ordering guarantee.
async fn process_one_video(
    compute: &ComputeHandles,
    attribution_config: &crate::config::AttributionConfig,
    candidate: &SourceDescriptor,
    audio: &crate::types::AudioArtifact,
    embedding_batch_size: usize,
    embed_known_only: bool,
) -> Result<VideoBatch, IngestError> {
    let source_id = candidate.source_id.clone();

    let transcript = {
        let _gpu = compute.gpu.acquire().await;
        compute.asr.transcribe(&audio.path).await?
    };

    let attributor = SpeakerAttributor::new(&compute.voice_profiles, compute.voice_embedder.as_ref(), attribution_config);

    let diarization_config = DiarizationConfig::from(attribution_config);
    let turns = if attribution_config.monologue_fast_path {
        let fast_path = {
            let _gpu = compute.gpu.acquire().await;
            attributor.monologue_fast_path(&audio.path).await
        };
        match fast_path {
            Ok(Some(name)) => {
                tracing::info!(source_id = %source_id, speaker = %name, "monologue fast-path matched across the full duration; skipping diarization");
                vec![Turn { t_start: 0.0, t_end: audio.duration_s, cluster_id: FALLBACK_CLUSTER_ID.to_string() }]
            }
            Ok(None) => {
                let _gpu = compute.gpu.acquire().await;
                compute.diarizer.diarize(&audio.path, &diarization_config).await
            }
            Err(err) => {
                tracing::warn!(source_id = %source_id, error = %err, "monologue fast-path sampling failed; falling back to diarization");
                let _gpu = compute.gpu.acquire().await;
                compute.diarizer.diarize(&audio.path, &diarization_config).await
            }
        }
    } else {
        let _gpu = compute.gpu.acquire().await;
        compute.diarizer.diarize(&audio.path, &diarization_config).await
    };

    let attribution = {
        let _gpu = compute.gpu.acquire().await;
        attributor
            .attribute(&source_id, &audio.path, &transcript.raw_segments, &turns)
            .await
            .map_err(|e| IngestError::Attribution(e, source_id.clone()))?
    };

    let eligible_texts: Vec<(uuid::Uuid, String)> = attribution
        .segments
        .iter()
        .filter(|s| is_eligible_for_embedding(s, embed_known_only))
        .map(|s| (s.segment_id, s.text.clone()))
        .collect();

    let embeddings = if eligible_texts.is_empty() {
        Vec::new()
    } else {
        let texts: Vec<String> = eligible_texts.iter().map(|(_, t)| t.clone()).collect();
        let vectors = {
            let _gpu = compute.gpu.acquire().await;
            compute.text_embedder.embed(&texts, embedding_batch_size).await?
        };
        eligible_texts
            .into_iter()
            .zip(vectors)
            .map(|((segment_id, _), vector)| TextEmbeddingRow {
                segment_id,
                model_key: compute.text_embedder.model_key().to_string(),
                dimensions: compute.text_embedder.dimensions() as i32,
                vector,
            })
            .collect()
    };

    Ok(VideoBatch { source_id, duration_s: audio.duration_s, segments: attribution.segments, embeddings })
}

async fn join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

impl ProgressCounters {
    fn log(&self, elapsed: Duration) {
        tracing::info!(
            elapsed_s = elapsed.as_secs(),
            listed = self.listed.load(Ordering::Relaxed),
            fetched = self.fetched.load(Ordering::Relaxed),
            transcribed = self.transcribed.load(Ordering::Relaxed),
            attributed = self.attributed.load(Ordering::Relaxed),
            embedded = self.embedded.load(Ordering::Relaxed),
            committed = self.committed.load(Ordering::Relaxed),
            errored = self.errored.load(Ordering::Relaxed),
            "ingestion progress"
        );
    }
}
