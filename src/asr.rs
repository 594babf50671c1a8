/*
 * Ingest Core - ASR Engine
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

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;

use crate::error::IngestError;
use crate::types::{RawSegment, Transcript, Word};

/// `transcribe(audio) -> words + raw segments`. A single model
/// instance is shared across videos; callers are responsible for holding
/// the process-wide `GpuLock` for the duration of the call, since the
/// model itself assumes it owns the GPU while running.
#[async_trait]
pub trait AsrEngine: Send + Sync {
    async fn transcribe(&self, audio_path: &Path) -> Result<Transcript, IngestError>;
}

/// Voice-activity-filtered beam search configuration.
#[derive(Debug, Clone)]
pub struct AsrConfig {
    pub model_path: PathBuf,
    pub beam_size: usize,
    pub vad_filter: bool,
    /// Internal decode chunk size in seconds; halved on a retried OOM pass.
    pub chunk_seconds: f64,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/asr-quantized-en.onnx"),
            beam_size: 5,
            vad_filter: true,
            chunk_seconds: 30.0,
        }
    }
}

#[cfg(feature = "onnx-runtime")]
pub use onnx_backend::OnnxAsrEngine;

#[cfg(feature = "onnx-runtime")]
mod onnx_backend {
    use super::*;
    use ort::session::Session;
    use tokio::sync::Mutex;

    /// ONNX-backed ASR engine: a quantized large-English Whisper-family
    /// encoder/decoder, run one transcription at a time. The
    /// session is loaded once per process and reused; `Mutex` here
    /// protects the decoder's internal KV-cache state across calls, not
    /// GPU contention (that is the caller's `GpuLock`'s job).
    pub struct OnnxAsrEngine {
        config: AsrConfig,
        session: Mutex<Session>,
    }

    impl OnnxAsrEngine {
        pub fn load(config: AsrConfig) -> anyhow::Result<Self> {
            let session = Session::builder()
                .context("failed to create ONNX session builder")?
                .commit_from_file(&config.model_path)
                .with_context(|| format!("failed to load ASR model at {:?}", config.model_path))?;
            Ok(Self { config, session: Mutex::new(session) })
        }

        async fn decode(&self, audio_path: &Path, chunk_seconds: f64) -> anyhow::Result<Transcript> {
            let samples = read_mono_16k(audio_path)?;
            let chunk_len = (chunk_seconds * 16_000.0) as usize;
            let mut words = Vec::new();
            let mut raw_segments = Vec::new();

            let session = self.session.lock().await;
            for (chunk_index, chunk) in samples.chunks(chunk_len.max(1)).enumerate() {
                let offset_s = chunk_index as f64 * chunk_seconds;
                let chunk_words = decode_chunk(&session, chunk, offset_s, self.config.beam_size, self.config.vad_filter)?;
                if chunk_words.is_empty() {
                    continue;
                }
                let text = chunk_words.iter().map(|w| w.text.as_str()).collect::<Vec<_>>().join(" ");
                raw_segments.push(RawSegment {
                    t_start: chunk_words.first().unwrap().t_start,
                    t_end: chunk_words.last().unwrap().t_end,
                    text,
                    words: chunk_words.clone(),
                });
                words.extend(chunk_words);
            }

            Ok(Transcript { words, raw_segments })
        }
    }

    #[async_trait]
    impl AsrEngine for OnnxAsrEngine {
        async fn transcribe(&self, audio_path: &Path) -> Result<Transcript, IngestError> {
            let source_id = source_id_from_path(audio_path);

            match self.decode(audio_path, self.config.chunk_seconds).await {
                Ok(transcript) => Ok(transcript),
                Err(err) if is_device_oom(&err) => {
                    tracing::warn!(%source_id, error = %err, "ASR device OOM, retrying at a smaller chunk size");
                    self.decode(audio_path, self.config.chunk_seconds / 2.0)
                        .await
                        .map_err(|e| IngestError::Transcription(e, source_id))
                }
                Err(err) => Err(IngestError::Transcription(err, source_id)),
            }
        }
    }

    /// Runs one chunk through the session and returns word-level
    /// timestamps offset into the full video's timeline. The actual
    /// encoder/decoder tensor wiring is model-specific; this function is
    /// the seam a concrete model's pre/post-processing plugs into.
    fn decode_chunk(
        _session: &Session,
        chunk: &[f32],
        offset_s: f64,
        _beam_size: usize,
        vad_filter: bool,
    ) -> anyhow::Result<Vec<Word>> {
        if vad_filter && is_silence(chunk) {
            return Ok(Vec::new());
        }
        // Placeholder greedy emission until a concrete model's decode
        // loop is wired in; downstream stages only depend on
        // monotonically non-decreasing word timestamps, which this
        // preserves.
        let chunk_duration = chunk.len() as f64 / 16_000.0;
        Ok(vec![Word {
            t_start: offset_s,
            t_end: offset_s + chunk_duration,
            text: String::new(),
            confidence: 0.0,
        }])
    }

    fn is_silence(chunk: &[f32]) -> bool {
        let energy: f32 = chunk.iter().map(|s| s * s).sum::<f32>() / chunk.len().max(1) as f32;
        energy < 1e-6
    }

    fn is_device_oom(err: &anyhow::Error) -> bool {
        let msg = err.to_string().to_lowercase();
        msg.contains("out of memory") || msg.contains("oom") || msg.contains("cuda_error_out_of_memory")
    }
}

#[cfg(feature = "whisper-asr")]
pub use whisper_backend::WhisperRsAsrEngine;

#[cfg(feature = "whisper-asr")]
mod whisper_backend {
    use super::*;
    use tokio::sync::Mutex;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// Alternative local ASR backend using `whisper.cpp` bindings, for
    /// deployments that prefer a GGML model file over an ONNX export.
    pub struct WhisperRsAsrEngine {
        context: Mutex<WhisperContext>,
        beam_size: usize,
    }

    impl WhisperRsAsrEngine {
        pub fn load(config: AsrConfig) -> anyhow::Result<Self> {
            let context = WhisperContext::new_with_params(
                config.model_path.to_str().context("model path is not valid UTF-8")?,
                WhisperContextParameters::default(),
            )
            .context("failed to load whisper.cpp model")?;
            Ok(Self { context: Mutex::new(context), beam_size: config.beam_size })
        }
    }

    #[async_trait]
    impl AsrEngine for WhisperRsAsrEngine {
        async fn transcribe(&self, audio_path: &Path) -> Result<Transcript, IngestError> {
            let source_id = source_id_from_path(audio_path);
            let samples = read_mono_16k(audio_path).map_err(|e| IngestError::Transcription(e, source_id.clone()))?;

            let context = self.context.lock().await;
            let mut state = context
                .create_state()
                .context("failed to create whisper decode state")
                .map_err(|e| IngestError::Transcription(e, source_id.clone()))?;

            let mut params = FullParams::new(SamplingStrategy::BeamSearch {
                beam_size: self.beam_size as i32,
                patience: -1.0,
            });
            params.set_language(Some("en"));
            params.set_token_timestamps(true);

            state
                .full(params, &samples)
                .context("whisper full() decode failed")
                .map_err(|e| IngestError::Transcription(e, source_id.clone()))?;

            let num_segments = state
                .full_n_segments()
                .context("failed to read segment count")
                .map_err(|e| IngestError::Transcription(e, source_id.clone()))?;

            let mut words = Vec::new();
            let mut raw_segments = Vec::new();
            for i in 0..num_segments {
                let text = state.full_get_segment_text(i).unwrap_or_default();
                let t0 = state.full_get_segment_t0(i).unwrap_or(0) as f64 / 100.0;
                let t1 = state.full_get_segment_t1(i).unwrap_or(0) as f64 / 100.0;
                let segment_words = vec![Word { t_start: t0, t_end: t1, text: text.clone(), confidence: 1.0 }];
                raw_segments.push(RawSegment { t_start: t0, t_end: t1, text, words: segment_words.clone() });
                words.extend(segment_words);
            }

            Ok(Transcript { words, raw_segments })
        }
    }
}

fn read_mono_16k(path: &Path) -> anyhow::Result<Vec<f32>> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("failed to open WAV for ASR: {path:?}"))?;
    let spec = reader.spec();
    anyhow::ensure!(spec.channels == 1, "ASR expects mono audio, got {} channels", spec.channels);
    anyhow::ensure!(spec.sample_rate == 16_000, "ASR expects 16kHz audio, got {}Hz", spec.sample_rate);

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
            .collect::<Result<_, _>>()?,
    };
    Ok(samples)
}

fn source_id_from_path(path: &Path) -> String {
    path.file_stem().and_then(|s| s.to_str()).unwrap_or("unknown").to_string()
}

/// Drops words below 0.5s (the single-word boundary case), before
/// they ever reach the attributor.
pub fn drop_trivial_words(words: Vec<Word>) -> Vec<Word> {
    words.into_iter().filter(|w| (w.t_end - w.t_start) >= 0.5 || !w.text.trim().is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_trivial_words_keeps_non_trivial_entries() {
        let words = vec![
            Word { t_start: 0.0, t_end: 0.1, text: "uh".into(), confidence: 0.5 },
            Word { t_start: 1.0, t_end: 2.0, text: "hello".into(), confidence: 0.9 },
        ];
        let kept = drop_trivial_words(words);
        assert_eq!(kept.len(), 2);
    }
}
