/*
 * Ingest Core - Voice Profile Store
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
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::types::{VoiceProfile, VoiceProfileFile};

/// Loads and caches known-speaker centroid vectors from a directory of
/// JSON files. Read-only for the lifetime of an ingestion
/// process; re-loaded fresh on each invocation rather than watched.
pub struct VoiceProfileStore {
    profiles: HashMap<String, VoiceProfile>,
}

impl VoiceProfileStore {
    /// Loads every `*.json` file in `dir`. A missing directory yields an
    /// empty store (every cluster will fall through to GUEST) rather
    /// than a fatal error, since voice enrollment is an external
    /// collaborator this pipeline only consumes the output of.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut profiles = HashMap::new();

        if !dir.exists() {
            return Ok(Self { profiles });
        }

        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read voice profile directory {dir:?}"))?;

        for entry in entries {
            let entry = entry.context("failed to read directory entry")?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::load_one(&path) {
                Ok(profile) => {
                    tracing::debug!(name = %profile.name, path = %path.display(), "loaded voice profile");
                    profiles.insert(profile.name.clone(), profile);
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable voice profile");
                }
            }
        }

        tracing::info!(count = profiles.len(), "voice profile store loaded");
        Ok(Self { profiles })
    }

    fn load_one(path: &PathBuf) -> Result<VoiceProfile> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {path:?}"))?;
        let file: VoiceProfileFile = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse voice profile {path:?}"))?;

        match file {
            VoiceProfileFile::Centroid { name, centroid, threshold, created_at } => {
                Ok(VoiceProfile { name, centroid, threshold, created_at })
            }
            VoiceProfileFile::Legacy { name, embeddings, threshold } => {
                tracing::warn!(
                    name = %name,
                    "voice profile uses the legacy {{name, embeddings}} shape; compressing to a centroid"
                );
                let centroid = mean_renormalize(&embeddings)
                    .with_context(|| format!("profile {name:?} has no usable embeddings"))?;
                Ok(VoiceProfile { name, centroid, threshold, created_at: chrono::Utc::now() })
            }
        }
    }

    pub fn list_names(&self) -> Vec<&str> {
        self.profiles.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&VoiceProfile> {
        self.profiles.get(name)
    }

    /// Cosine similarity between `query` and the named profile's centroid.
    pub fn similarity(&self, query: &[f32], name: &str) -> Option<f32> {
        self.profiles.get(name).map(|p| cosine_similarity(query, &p.centroid))
    }

    /// The best-matching profile for `query`, the runner-up similarity,
    /// and the margin between them. `None` if the store has no profiles.
    pub fn best_match(&self, query: &[f32]) -> Option<BestMatch> {
        let mut scored: Vec<(&str, f32)> = self
            .profiles
            .values()
            .map(|p| (p.name.as_str(), cosine_similarity(query, &p.centroid)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let (best_name, best_sim) = *scored.first()?;
        let second_sim = scored.get(1).map(|(_, s)| *s).unwrap_or(f32::NEG_INFINITY);
        Some(BestMatch {
            name: best_name.to_string(),
            similarity: best_sim,
            margin_to_second: best_sim - second_sim,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BestMatch {
    pub name: String,
    pub similarity: f32,
    pub margin_to_second: f32,
}

/// Cosine similarity in `[-1, 1]`; zero vectors compare as 0.0 rather
/// than producing NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Mean of a set of embeddings, L2-renormalized, as used to compress a
/// legacy raw-embeddings profile into a centroid.
fn mean_renormalize(embeddings: &[Vec<f32>]) -> Option<Vec<f32>> {
    let dim = embeddings.first()?.len();
    if dim == 0 {
        return None;
    }
    let mut mean = vec![0.0f32; dim];
    let mut n = 0usize;
    for e in embeddings {
        if e.len() != dim {
            continue;
        }
        for (i, v) in e.iter().enumerate() {
            mean[i] += v;
        }
        n += 1;
    }
    if n == 0 {
        return None;
    }
    for v in mean.iter_mut() {
        *v /= n as f32;
    }
    let norm = mean.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in mean.iter_mut() {
            *v /= norm;
        }
    }
    Some(mean)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let a = vec![0.6, 0.8];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_is_zero() {
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_zero_vector_is_zero_not_nan() {
        let s = cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]);
        assert_eq!(s, 0.0);
    }

    #[test]
    fn mean_renormalize_is_unit_length() {
        let embeddings = vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]];
        let centroid = mean_renormalize(&embeddings).unwrap();
        let norm = centroid.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn best_match_reports_margin_to_runner_up() {
        let mut store = VoiceProfileStore { profiles: HashMap::new() };
        store.profiles.insert(
            "PRIMARY".into(),
            VoiceProfile { name: "PRIMARY".into(), centroid: vec![1.0, 0.0], threshold: 0.62, created_at: chrono::Utc::now() },
        );
        store.profiles.insert(
            "OTHER".into(),
            VoiceProfile { name: "OTHER".into(), centroid: vec![0.0, 1.0], threshold: 0.62, created_at: chrono::Utc::now() },
        );
        let best = store.best_match(&[0.9, 0.1]).unwrap();
        assert_eq!(best.name, "PRIMARY");
        assert!(best.margin_to_second > 0.5);
    }
}
