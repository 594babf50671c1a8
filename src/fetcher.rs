/*
 * Ingest Core - Audio Fetcher
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
use std::process::Stdio;
use std::time::Duration;

use rand::Rng;
use tokio::process::Command;
use tokio::time::sleep;

use crate::config::Config;
use crate::error::{FetchErrorKind, IngestError};
use crate::types::AudioArtifact;

const MIN_FILE_SIZE_BYTES: u64 = 50 * 1024;
const MAX_RETRIES: u32 = 15;
const DURATION_TOLERANCE: f64 = 0.05;

/// The player-client strategies tried in order. Each is a
/// distinct `yt-dlp` extractor-args value; rotating through them is how
/// the fetcher works around a hostile source's per-client rate limiting.
const CLIENT_STRATEGIES: &[&str] = &["web", "android", "default"];

/// Optional credentials attached to a fetch attempt when configured.
#[derive(Debug, Clone, Default)]
pub struct FetchCredentials {
    pub po_token: Option<String>,
    pub cookie_jar: Option<PathBuf>,
}

/// Downloads best-audio streams to local temporary files with retry,
/// client rotation, and integrity checks.
pub struct AudioFetcher {
    temp_dir: PathBuf,
    credentials: FetchCredentials,
}

impl AudioFetcher {
    pub fn new(config: &Config, credentials: FetchCredentials) -> Self {
        Self { temp_dir: config.temp_dir.clone(), credentials }
    }

    /// Obtains a local, validated, 16 kHz mono WAV for `source_id`.
    pub async fn fetch(&self, source_id: &str) -> Result<AudioArtifact, IngestError> {
        let mut last_kind = FetchErrorKind::UnavailableSource;
        let mut last_err: Option<anyhow::Error> = None;

        for strategy in CLIENT_STRATEGIES {
            match self.fetch_with_strategy(source_id, strategy).await {
                Ok(artifact) => return Ok(artifact),
                Err((kind, err)) => {
                    tracing::warn!(source_id, strategy, error = %err, "fetch strategy failed");
                    last_kind = kind;
                    last_err = Some(err);
                    if matches!(kind, FetchErrorKind::CorruptDownload) {
                        // Non-retriable for this session: skip straight to the next strategy.
                        continue;
                    }
                }
            }
        }

        Err(IngestError::Fetch {
            source_id: source_id.to_string(),
            kind: last_kind,
            cause: last_err.unwrap_or_else(|| anyhow::anyhow!("all client strategies exhausted")),
        })
    }

    async fn fetch_with_strategy(
        &self,
        source_id: &str,
        strategy: &str,
    ) -> Result<AudioArtifact, (FetchErrorKind, anyhow::Error)> {
        let raw_path = self.temp_dir.join(format!("{source_id}_{strategy}_raw.m4a"));

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.download_once(source_id, strategy, &raw_path).await {
                Ok(()) => break,
                Err(kind) if crate::error::fetch_kind_is_retriable(kind) && attempt <= MAX_RETRIES => {
                    let backoff = backoff_duration(attempt);
                    tracing::warn!(source_id, strategy, attempt, ?backoff, ?kind, "retrying download");
                    sleep(backoff).await;
                }
                Err(kind) => {
                    return Err((kind, anyhow::anyhow!("download failed after {attempt} attempt(s) via {strategy}")));
                }
            }
        }

        match self.validate_and_convert(source_id, &raw_path).await {
            Ok(artifact) => Ok(artifact),
            Err(err) => {
                let _ = std::fs::remove_file(&raw_path);
                Err((FetchErrorKind::CorruptDownload, err))
            }
        }
    }

    async fn download_once(
        &self,
        source_id: &str,
        strategy: &str,
        dest: &Path,
    ) -> Result<(), FetchErrorKind> {
        let mut cmd = Command::new("yt-dlp");
        cmd.arg("-f").arg("bestaudio")
            .arg("--extractor-args").arg(format!("youtube:player_client={strategy}"))
            .arg("-o").arg(dest)
            .arg("--no-playlist")
            .arg("--no-warnings")
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        if let Some(token) = &self.credentials.po_token {
            cmd.arg("--extractor-args").arg(format!("youtube:po_token={token}"));
        }
        if let Some(jar) = &self.credentials.cookie_jar {
            cmd.arg("--cookies").arg(jar);
        }

        cmd.arg(format!("https://www.youtube.com/watch?v={source_id}"));

        let output = cmd.output().await.map_err(|_| FetchErrorKind::UnavailableSource)?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        if stderr.contains("429") || stderr.contains("rate") {
            Err(FetchErrorKind::RateLimited)
        } else if stderr.contains("sign in") || stderr.contains("bot") || stderr.contains("captcha") {
            Err(FetchErrorKind::BotChallenged)
        } else if stderr.contains("private") || stderr.contains("unavailable") || stderr.contains("removed") {
            Err(FetchErrorKind::UnavailableSource)
        } else {
            Err(FetchErrorKind::CorruptDownload)
        }
    }

    /// Validates the downloaded file and converts it to 16 kHz mono WAV,
    /// per the post-download checklist.
    async fn validate_and_convert(&self, source_id: &str, raw_path: &Path) -> anyhow::Result<AudioArtifact> {
        let metadata = std::fs::metadata(raw_path)
            .map_err(|e| anyhow::anyhow!("downloaded file missing: {e}"))?;
        if metadata.len() < MIN_FILE_SIZE_BYTES {
            anyhow::bail!("downloaded file too small ({} bytes)", metadata.len());
        }

        let declared_duration = probe_duration(raw_path).await?;

        let wav_path = self.temp_dir.join(format!("{source_id}.wav"));
        let status = Command::new("ffmpeg")
            .arg("-y")
            .arg("-i").arg(raw_path)
            .arg("-ac").arg("1")
            .arg("-ar").arg("16000")
            .arg(&wav_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| anyhow::anyhow!("failed to invoke ffmpeg: {e}"))?;
        if !status.success() {
            anyhow::bail!("ffmpeg conversion to 16kHz mono WAV failed");
        }
        let _ = std::fs::remove_file(raw_path);

        let reader = hound::WavReader::open(&wav_path)
            .map_err(|e| anyhow::anyhow!("converted WAV is not decodable: {e}"))?;
        let spec = reader.spec();
        let actual_duration = reader.duration() as f64 / spec.sample_rate as f64;

        if declared_duration > 0.0 {
            let delta = (actual_duration - declared_duration).abs() / declared_duration;
            if delta > DURATION_TOLERANCE {
                anyhow::bail!(
                    "converted duration {actual_duration:.1}s differs from declared {declared_duration:.1}s by {:.1}%",
                    delta * 100.0
                );
            }
        }

        Ok(AudioArtifact { path: wav_path, duration_s: actual_duration, sample_rate: spec.sample_rate })
    }
}

async fn probe_duration(path: &Path) -> anyhow::Result<f64> {
    let output = Command::new("ffprobe")
        .arg("-v").arg("error")
        .arg("-show_entries").arg("format=duration")
        .arg("-of").arg("default=noprint_wrappers=1:nokey=1")
        .arg(path)
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("failed to invoke ffprobe: {e}"))?;
    if !output.status.success() {
        return Ok(0.0);
    }
    String::from_utf8_lossy(&output.stdout).trim().parse::<f64>().or(Ok(0.0))
}

/// Exponential backoff (base 1-2s, jittered between 2-5s).
fn backoff_duration(attempt: u32) -> Duration {
    let base = 1.0 + rand::thread_rng().gen::<f64>();
    let exp = base * 2f64.powi((attempt - 1) as i32).min(30.0);
    let jitter = rand::thread_rng().gen_range(2.0..5.0);
    Duration::from_secs_f64((exp + jitter).min(60.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_attempt_number_but_is_capped() {
        let first = backoff_duration(1);
        let later = backoff_duration(10);
        assert!(first.as_secs_f64() >= 2.0);
        assert!(later.as_secs_f64() <= 60.0);
    }

    #[test]
    fn client_strategies_try_web_before_default() {
        assert_eq!(CLIENT_STRATEGIES[0], "web");
        assert_eq!(*CLIENT_STRATEGIES.last().unwrap(), "default");
    }
}
