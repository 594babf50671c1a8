/*
 * Ingest Core - Persistence Writer
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

use std::str::FromStr;

use anyhow::Context;
use pgvector::Vector;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::IngestError;
use crate::types::{IngestStatus, Segment, SpeakerLabel, Source, TextEmbeddingRow};

/// Idempotent commit of one video's artifacts. Every public
/// method here either succeeds as a whole for one video or rolls back;
/// callers never accumulate work across videos before calling in, per
/// the "commit eagerly" critical rule.
pub struct PersistenceWriter {
    pool: PgPool,
}

impl PersistenceWriter {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to the persistence store")?;
        Ok(Self { pool })
    }

    /// Creates the schema if it does not already exist.
    /// Out of scope in production (owned by migration tooling),
    /// but useful for tests and first-run bootstrapping against a fresh
    /// database.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE EXTENSION IF NOT EXISTS vector;

            CREATE TABLE IF NOT EXISTS sources (
                source_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                published_at TIMESTAMPTZ,
                duration_seconds DOUBLE PRECISION,
                channel TEXT NOT NULL,
                ingest_status TEXT NOT NULL,
                last_error TEXT,
                processed_at TIMESTAMPTZ
            );

            CREATE TABLE IF NOT EXISTS segments (
                segment_id UUID PRIMARY KEY,
                source_id TEXT NOT NULL REFERENCES sources(source_id),
                ordinal INTEGER NOT NULL,
                start_s DOUBLE PRECISION NOT NULL,
                end_s DOUBLE PRECISION NOT NULL,
                text TEXT NOT NULL,
                speaker_discriminator TEXT NOT NULL,
                speaker_name TEXT,
                speaker_confidence REAL,
                voice_embedding vector,
                asr_confidence REAL,
                UNIQUE (source_id, ordinal)
            );
            CREATE INDEX IF NOT EXISTS idx_segments_source_ordinal ON segments(source_id, ordinal);

            CREATE TABLE IF NOT EXISTS text_embeddings (
                segment_id UUID NOT NULL REFERENCES segments(segment_id),
                model_key TEXT NOT NULL,
                dimensions INTEGER NOT NULL,
                vector vector NOT NULL,
                PRIMARY KEY (segment_id, model_key)
            );

            CREATE TABLE IF NOT EXISTS voice_profiles (
                name TEXT PRIMARY KEY,
                centroid vector NOT NULL,
                threshold REAL NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to bootstrap schema")?;
        Ok(())
    }

    /// True iff the source_id has status=done, used by the skip-existing filter.
    pub async fn is_done(&self, source_id: &str) -> anyhow::Result<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT ingest_status FROM sources WHERE source_id = $1")
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await
                .context("failed to query source status")?;
        Ok(row.map(|(s,)| s == IngestStatus::Done.as_str()).unwrap_or(false))
    }

    /// Transitions a Source to `running`, inserting a fresh row if none exists.
    pub async fn mark_running(&self, descriptor: &Source) -> Result<(), IngestError> {
        sqlx::query(
            r#"
            INSERT INTO sources (source_id, title, published_at, duration_seconds, channel, ingest_status, last_error, processed_at)
            VALUES ($1, $2, $3, $4, $5, 'running', NULL, NULL)
            ON CONFLICT (source_id) DO UPDATE SET
                ingest_status = 'running',
                last_error = NULL,
                title = EXCLUDED.title
            "#,
        )
        .bind(&descriptor.source_id)
        .bind(&descriptor.title)
        .bind(descriptor.published_at)
        .bind(descriptor.duration_seconds)
        .bind(&descriptor.channel)
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Persistence(e.into(), descriptor.source_id.clone()))?;
        Ok(())
    }

    /// Commits one video's segments and embeddings in a single
    /// transaction, then marks the Source `done`. On any failure the
    /// transaction rolls back and the Source is marked `error` instead.
    pub async fn commit_video(
        &self,
        source_id: &str,
        duration_s: f64,
        segments: &[Segment],
        embeddings: &[TextEmbeddingRow],
        force: bool,
    ) -> Result<(), IngestError> {
        match self.commit_video_inner(source_id, duration_s, segments, embeddings, force).await {
            Ok(()) => {
                self.mark_done(source_id).await?;
                tracing::info!(source_id, segments = segments.len(), embeddings = embeddings.len(), "committed video");
                Ok(())
            }
            Err(err) => {
                let ingest_err = IngestError::Persistence(err, source_id.to_string());
                self.mark_error(source_id, &ingest_err.last_error_text()).await.ok();
                Err(ingest_err)
            }
        }
    }

    async fn commit_video_inner(
        &self,
        source_id: &str,
        duration_s: f64,
        segments: &[Segment],
        embeddings: &[TextEmbeddingRow],
        force: bool,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("failed to start transaction")?;

        sqlx::query("UPDATE sources SET duration_seconds = $2 WHERE source_id = $1")
            .bind(source_id)
            .bind(duration_s)
            .execute(&mut *tx)
            .await
            .context("failed to record source duration")?;

        if force {
            self.delete_prior_artifacts(&mut tx, source_id).await?;
        }

        for segment in segments {
            self.insert_segment(&mut tx, segment).await?;
        }

        for embedding in embeddings {
            self.insert_embedding(&mut tx, embedding).await?;
        }

        tx.commit().await.context("failed to commit video transaction")?;
        Ok(())
    }

    async fn delete_prior_artifacts(&self, tx: &mut Transaction<'_, Postgres>, source_id: &str) -> anyhow::Result<()> {
        sqlx::query(
            "DELETE FROM text_embeddings WHERE segment_id IN (SELECT segment_id FROM segments WHERE source_id = $1)",
        )
        .bind(source_id)
        .execute(&mut **tx)
        .await
        .context("failed to delete prior embeddings")?;

        sqlx::query("DELETE FROM segments WHERE source_id = $1")
            .bind(source_id)
            .execute(&mut **tx)
            .await
            .context("failed to delete prior segments")?;
        Ok(())
    }

    async fn insert_segment(&self, tx: &mut Transaction<'_, Postgres>, segment: &Segment) -> anyhow::Result<()> {
        let embedding = segment.voice_embedding.clone().map(Vector::from);
        sqlx::query(
            r#"
            INSERT INTO segments
                (segment_id, source_id, ordinal, start_s, end_s, text, speaker_discriminator, speaker_name, speaker_confidence, voice_embedding, asr_confidence)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (source_id, ordinal) DO NOTHING
            "#,
        )
        .bind(segment.segment_id)
        .bind(&segment.source_id)
        .bind(segment.ordinal)
        .bind(segment.start_s)
        .bind(segment.end_s)
        .bind(&segment.text)
        .bind(segment.speaker_label.discriminator())
        .bind(segment.speaker_label.name())
        .bind(segment.speaker_confidence)
        .bind(embedding)
        .bind(segment.asr_confidence)
        .execute(&mut **tx)
        .await
        .context("failed to insert segment")?;
        Ok(())
    }

    async fn insert_embedding(&self, tx: &mut Transaction<'_, Postgres>, embedding: &TextEmbeddingRow) -> anyhow::Result<()> {
        let vector = Vector::from(embedding.vector.clone());
        sqlx::query(
            r#"
            INSERT INTO text_embeddings (segment_id, model_key, dimensions, vector)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (segment_id, model_key) DO UPDATE SET
                dimensions = EXCLUDED.dimensions,
                vector = EXCLUDED.vector
            "#,
        )
        .bind(embedding.segment_id)
        .bind(&embedding.model_key)
        .bind(embedding.dimensions)
        .bind(vector)
        .execute(&mut **tx)
        .await
        .context("failed to insert text embedding")?;
        Ok(())
    }

    async fn mark_done(&self, source_id: &str) -> Result<(), IngestError> {
        sqlx::query("UPDATE sources SET ingest_status = 'done', processed_at = now() WHERE source_id = $1")
            .bind(source_id)
            .execute(&self.pool)
            .await
            .map_err(|e| IngestError::Persistence(e.into(), source_id.to_string()))?;
        Ok(())
    }

    pub async fn mark_error(&self, source_id: &str, message: &str) -> Result<(), IngestError> {
        sqlx::query("UPDATE sources SET ingest_status = 'error', last_error = $2, processed_at = now() WHERE source_id = $1")
            .bind(source_id)
            .bind(message)
            .execute(&self.pool)
            .await
            .map_err(|e| IngestError::Persistence(e.into(), source_id.to_string()))?;
        Ok(())
    }

    pub async fn status_of(&self, source_id: &str) -> anyhow::Result<Option<IngestStatus>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT ingest_status FROM sources WHERE source_id = $1")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(s,)| IngestStatus::from_str(&s)).transpose()
    }

    /// Segment and embedding counts for a source, used by tests and
    /// operator tooling to sanity-check committed invariants.
    pub async fn counts_for(&self, source_id: &str) -> anyhow::Result<(i64, i64)> {
        let segment_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM segments WHERE source_id = $1")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        let embedding_count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM text_embeddings te JOIN segments s ON s.segment_id = te.segment_id WHERE s.source_id = $1",
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok((segment_count.0, embedding_count.0))
    }
}

/// A segment is eligible for text embedding iff its text is non-empty
/// AND (not embed_known_only OR its label is known or null).
/// A null label here means "unknown" in the typed model — this reading
/// treats `Unknown` as eligible too, logging
/// a warning so the ambiguity stays auditable.
pub fn is_eligible_for_embedding(segment: &Segment, embed_known_only: bool) -> bool {
    if segment.text.trim().is_empty() {
        return false;
    }
    if !embed_known_only {
        return true;
    }
    match &segment.speaker_label {
        SpeakerLabel::Known(_) => true,
        SpeakerLabel::Unknown => {
            tracing::warn!(
                segment_id = %segment.segment_id,
                "segment has an unknown speaker label but embed_known_only is set; embedding it anyway (bugfixed reading, see design notes)"
            );
            true
        }
        SpeakerLabel::Guest => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SpeakerLabel;
    use uuid::Uuid;

    fn segment_with(label: SpeakerLabel, text: &str) -> Segment {
        Segment {
            segment_id: Uuid::new_v4(),
            source_id: "abc".into(),
            ordinal: 0,
            start_s: 0.0,
            end_s: 1.0,
            text: text.into(),
            speaker_label: label,
            speaker_confidence: None,
            voice_embedding: None,
            asr_confidence: None,
        }
    }

    #[test]
    fn empty_text_is_never_eligible() {
        assert!(!is_eligible_for_embedding(&segment_with(SpeakerLabel::Known("P".into()), ""), false));
        assert!(!is_eligible_for_embedding(&segment_with(SpeakerLabel::Known("P".into()), "   "), true));
    }

    #[test]
    fn guest_is_excluded_only_when_restricted_to_known() {
        let guest = segment_with(SpeakerLabel::Guest, "hello");
        assert!(is_eligible_for_embedding(&guest, false));
        assert!(!is_eligible_for_embedding(&guest, true));
    }

    #[test]
    fn unknown_label_is_eligible_even_when_restricted_to_known() {
        let unknown = segment_with(SpeakerLabel::Unknown, "hello");
        assert!(is_eligible_for_embedding(&unknown, true));
    }

    #[test]
    fn known_label_is_always_eligible() {
        let known = segment_with(SpeakerLabel::Known("PRIMARY".into()), "hello");
        assert!(is_eligible_for_embedding(&known, true));
        assert!(is_eligible_for_embedding(&known, false));
    }
}
