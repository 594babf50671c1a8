/*
 * Ingest Core - GPU Resource Discipline
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

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

/// A long-lived handle to the single GPU that ASR, diarization,
/// voice-embedding, and text-embedding all share.
///
/// Parallelism across compute stages is disallowed by default:
/// the orchestrator hands this same handle to every compute worker so
/// that only one kernel launch is ever in flight. It is an explicit,
/// owned value rather than a module-level singleton.
#[derive(Clone)]
pub struct GpuLock {
    inner: Arc<Mutex<()>>,
}

impl GpuLock {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(())) }
    }

    /// Acquire exclusive access to the GPU for the duration of the guard.
    pub async fn acquire(&self) -> GpuGuard<'_> {
        let guard = self.inner.lock().await;
        GpuGuard { _guard: guard }
    }
}

impl Default for GpuLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard representing exclusive GPU ownership. Dropping it releases
/// the mutex; callers are expected to have already released device-side
/// caches (see `CacheRelease`) before dropping.
pub struct GpuGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// Marker trait for compute stages that must release device memory
/// caches both before they run (to evict a prior stage's tensors) and
/// after (to evict their own activation footprint).
pub trait CacheRelease {
    /// Called immediately before the stage's GPU work starts.
    fn release_before(&self) {
        tracing::debug!("releasing device cache before compute stage");
    }

    /// Called immediately after the stage's GPU work completes, whether
    /// it succeeded or failed.
    fn release_after(&self) {
        tracing::debug!("releasing device cache after compute stage");
    }
}
