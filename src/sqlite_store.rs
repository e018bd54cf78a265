//! SQLite-backed [`Store`] implementation.
//!
//! Every status change is a single `UPDATE ... WHERE extraction_status = ?`
//! so the compare-and-set happens inside SQLite. Writes under a claim also
//! match the claim token. Completion writes the chunk
//! row, its vector, and its FTS5 entry in one transaction; a chunk is only
//! visible to retrieval once that transaction commits.
//!
//! Vector similarity is brute-force cosine in Rust over the in-scope
//! vectors. Lexical relevance comes from FTS5 `bm25()`, negated so higher
//! is better.

use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

use transcript_retrieval_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use transcript_retrieval_core::lexical::LexicalEntry;
use transcript_retrieval_core::models::{
    Chunk, ChunkMetadata, DerivedSignals, EntityMention, Transcript,
};
use transcript_retrieval_core::status::{ExtractionStatus, Transition};
use transcript_retrieval_core::store::{
    check_settlement, check_transition, CandidateQuery, ChunkCandidate, Claim, ClaimKind, FailedChunk, ReclaimedClaim,
    RequeueCounts, StatusReport, Store,
};
use transcript_retrieval_core::vocab::{QualificationTag, Topic};

const CHUNK_SELECT: &str = r#"
    SELECT c.id, c.transcript_id, c.chunk_index, c.text, c.start_offset, c.end_offset,
           c.hash, c.entities_json, c.topics_json, c.tags_json, c.lexical_json,
           c.extraction_status, c.attempts, c.last_error, c.updated_at, c.claimed_at,
           c.claim_token, c.completed_at, c.previous_status, c.stuck_ms, c.reclaim_count,
           cv.embedding AS embedding
    FROM chunks c
    LEFT JOIN chunk_vectors cv ON cv.chunk_id = c.id
"#;

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_status(raw: &str) -> Result<ExtractionStatus> {
    raw.parse()
}

fn parse_optional_status(raw: Option<String>) -> Result<Option<ExtractionStatus>> {
    raw.as_deref().map(parse_status).transpose()
}

fn transcript_from_row(row: &SqliteRow) -> Result<Transcript> {
    let analysis_status: String = row.try_get("analysis_status")?;
    let index_status: String = row.try_get("index_status")?;
    let index_attempts: i64 = row.try_get("index_attempts")?;
    let reclaim_count: i64 = row.try_get("index_reclaim_count")?;
    Ok(Transcript {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        rep_id: row.try_get("rep_id")?,
        team_id: row.try_get("team_id")?,
        raw_text: row.try_get("raw_text")?,
        text_hash: row.try_get("text_hash")?,
        analysis_status: analysis_status.parse()?,
        index_status: parse_status(&index_status)?,
        index_attempts: index_attempts as u32,
        index_updated_at: row.try_get("index_updated_at")?,
        index_previous_status: parse_optional_status(row.try_get("index_previous_status")?)?,
        index_stuck_ms: row.try_get("index_stuck_ms")?,
        index_reclaim_count: reclaim_count as u32,
        index_claim_token: row.try_get("index_claim_token")?,
        last_activity_at: row.try_get("last_activity_at")?,
        created_at: row.try_get("created_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    let id: String = row.try_get("id")?;
    let entities_json: String = row.try_get("entities_json")?;
    let topics_json: String = row.try_get("topics_json")?;
    let tags_json: String = row.try_get("tags_json")?;
    let lexical_json: Option<String> = row.try_get("lexical_json")?;
    let embedding: Option<Vec<u8>> = row.try_get("embedding")?;
    let status: String = row.try_get("extraction_status")?;
    let start_offset: i64 = row.try_get("start_offset")?;
    let end_offset: i64 = row.try_get("end_offset")?;
    let attempts: i64 = row.try_get("attempts")?;
    let reclaim_count: i64 = row.try_get("reclaim_count")?;

    let entities: Vec<EntityMention> = serde_json::from_str(&entities_json)
        .with_context(|| format!("Bad entities_json on chunk {}", id))?;
    let topics: BTreeSet<Topic> = serde_json::from_str(&topics_json)
        .with_context(|| format!("Bad topics_json on chunk {}", id))?;
    let qualification_tags: BTreeSet<QualificationTag> = serde_json::from_str(&tags_json)
        .with_context(|| format!("Bad tags_json on chunk {}", id))?;
    let lexical: Option<LexicalEntry> = lexical_json
        .map(|j| serde_json::from_str(&j))
        .transpose()
        .with_context(|| format!("Bad lexical_json on chunk {}", id))?;

    Ok(Chunk {
        transcript_id: row.try_get("transcript_id")?,
        chunk_index: row.try_get("chunk_index")?,
        text: row.try_get("text")?,
        start_offset: start_offset as usize,
        end_offset: end_offset as usize,
        hash: row.try_get("hash")?,
        embedding: embedding.map(|b| blob_to_vec(&b)),
        lexical,
        entities,
        topics,
        qualification_tags,
        extraction_status: parse_status(&status)?,
        metadata: ChunkMetadata {
            attempts: attempts as u32,
            last_error: row.try_get("last_error")?,
            updated_at: row.try_get("updated_at")?,
            claimed_at: row.try_get("claimed_at")?,
            claim_token: row.try_get("claim_token")?,
            completed_at: row.try_get("completed_at")?,
            previous_status: parse_optional_status(row.try_get("previous_status")?)?,
            stuck_ms: row.try_get("stuck_ms")?,
            reclaim_count: reclaim_count as u32,
        },
        id,
    })
}

/// Turn free text into an FTS5 query: every term quoted, OR-ed together.
/// Returns `None` when the text has no searchable terms.
fn fts_match_expr(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{}\"", w.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

async fn write_transcript(conn: &mut SqliteConnection, t: &Transcript) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO transcripts (id, title, rep_id, team_id, raw_text, text_hash,
                                 analysis_status, index_status, index_attempts,
                                 index_updated_at, index_previous_status, index_stuck_ms,
                                 index_reclaim_count, index_claim_token, last_activity_at,
                                 created_at, deleted_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            rep_id = excluded.rep_id,
            team_id = excluded.team_id,
            raw_text = excluded.raw_text,
            text_hash = excluded.text_hash,
            analysis_status = excluded.analysis_status,
            index_status = excluded.index_status,
            index_attempts = excluded.index_attempts,
            index_updated_at = excluded.index_updated_at,
            index_previous_status = excluded.index_previous_status,
            index_stuck_ms = excluded.index_stuck_ms,
            index_reclaim_count = excluded.index_reclaim_count,
            index_claim_token = excluded.index_claim_token,
            last_activity_at = excluded.last_activity_at,
            deleted_at = excluded.deleted_at
        "#,
    )
    .bind(&t.id)
    .bind(&t.title)
    .bind(&t.rep_id)
    .bind(&t.team_id)
    .bind(&t.raw_text)
    .bind(&t.text_hash)
    .bind(t.analysis_status.as_str())
    .bind(t.index_status.as_str())
    .bind(i64::from(t.index_attempts))
    .bind(t.index_updated_at)
    .bind(t.index_previous_status.map(|s| s.as_str()))
    .bind(t.index_stuck_ms)
    .bind(i64::from(t.index_reclaim_count))
    .bind(&t.index_claim_token)
    .bind(t.last_activity_at)
    .bind(t.created_at)
    .bind(t.deleted_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_chunks(
    conn: &mut SqliteConnection,
    transcript_id: &str,
    chunks: &[Chunk],
) -> Result<()> {
    sqlx::query("DELETE FROM chunk_vectors WHERE transcript_id = ?")
        .bind(transcript_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM chunks_fts WHERE transcript_id = ?")
        .bind(transcript_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE transcript_id = ?")
        .bind(transcript_id)
        .execute(&mut *conn)
        .await?;

    for chunk in chunks {
        let m = &chunk.metadata;
        sqlx::query(
            r#"
            INSERT INTO chunks (id, transcript_id, chunk_index, text, start_offset, end_offset,
                                hash, entities_json, topics_json, tags_json, lexical_json,
                                extraction_status, attempts, last_error, updated_at,
                                claimed_at, claim_token, completed_at, previous_status,
                                stuck_ms, reclaim_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(transcript_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(chunk.start_offset as i64)
        .bind(chunk.end_offset as i64)
        .bind(&chunk.hash)
        .bind(serde_json::to_string(&chunk.entities)?)
        .bind(serde_json::to_string(&chunk.topics)?)
        .bind(serde_json::to_string(&chunk.qualification_tags)?)
        .bind(chunk.lexical.as_ref().map(serde_json::to_string).transpose()?)
        .bind(chunk.extraction_status.as_str())
        .bind(i64::from(m.attempts))
        .bind(&m.last_error)
        .bind(m.updated_at)
        .bind(m.claimed_at)
        .bind(&m.claim_token)
        .bind(m.completed_at)
        .bind(m.previous_status.map(|s| s.as_str()))
        .bind(m.stuck_ms)
        .bind(i64::from(m.reclaim_count))
        .execute(&mut *conn)
        .await?;

        if chunk.extraction_status != ExtractionStatus::Completed {
            continue;
        }
        if let Some(vec) = &chunk.embedding {
            sqlx::query(
                "INSERT INTO chunk_vectors (chunk_id, transcript_id, dims, embedding) VALUES (?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(transcript_id)
            .bind(vec.len() as i64)
            .bind(vec_to_blob(vec))
            .execute(&mut *conn)
            .await?;
        }
        sqlx::query("INSERT INTO chunks_fts (chunk_id, transcript_id, text) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(transcript_id)
            .bind(&chunk.text)
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_transcript(&self, t: &Transcript) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_transcript(&mut conn, t).await
    }

    async fn get_transcript(&self, id: &str) -> Result<Option<Transcript>> {
        let row = sqlx::query("SELECT * FROM transcripts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(transcript_from_row).transpose()
    }

    async fn soft_delete_transcript(&self, id: &str, now: i64) -> Result<bool> {
        let result =
            sqlx::query("UPDATE transcripts SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn replace_chunks(&self, transcript_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_chunks(&mut tx, transcript_id, chunks).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_transcript(&self, transcript: &Transcript, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_transcript(&mut tx, transcript).await?;
        write_chunks(&mut tx, &transcript.id, chunks).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_chunks(&self, transcript_id: &str) -> Result<Vec<Chunk>> {
        let sql = format!(
            "{} WHERE c.transcript_id = ? ORDER BY c.chunk_index ASC",
            CHUNK_SELECT
        );
        let rows = sqlx::query(&sql)
            .bind(transcript_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        let sql = format!("{} WHERE c.id = ?", CHUNK_SELECT);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(chunk_from_row).transpose()
    }

    async fn claim_next_transcript(&self, now: i64) -> Result<Option<Claim>> {
        let token = Uuid::new_v4().to_string();
        let id: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE transcripts
            SET index_status = 'processing', index_updated_at = ?, index_claim_token = ?
            WHERE index_status = 'pending'
              AND id = (
                SELECT id FROM transcripts
                WHERE index_status = 'pending' AND deleted_at IS NULL
                ORDER BY index_updated_at ASC, id ASC
                LIMIT 1
              )
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(&token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id.map(|id| Claim { id, token }))
    }

    async fn settle_transcript(
        &self,
        claim: &Claim,
        to: ExtractionStatus,
        now: i64,
    ) -> Result<bool> {
        let transition = check_settlement(to)?;
        let attempts = match transition {
            Transition::Fail => "index_attempts + 1",
            _ => "index_attempts",
        };
        let sql = format!(
            "UPDATE transcripts \
             SET index_status = ?, index_updated_at = ?, index_attempts = {}, index_claim_token = NULL \
             WHERE id = ? AND index_status = 'processing' AND index_claim_token = ?",
            attempts
        );
        let result = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(now)
            .bind(&claim.id)
            .bind(&claim.token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_chunk(&self, chunk_id: &str, now: i64) -> Result<Option<Claim>> {
        let claim = Claim::mint(chunk_id);
        let result = sqlx::query(
            r#"
            UPDATE chunks
            SET extraction_status = 'processing', updated_at = ?1, claimed_at = ?1, claim_token = ?2
            WHERE id = ?3 AND extraction_status = 'pending'
            "#,
        )
        .bind(now)
        .bind(&claim.token)
        .bind(chunk_id)
        .execute(&self.pool)
        .await?;
        Ok((result.rows_affected() == 1).then_some(claim))
    }

    async fn transition_chunk(
        &self,
        id: &str,
        from: ExtractionStatus,
        to: ExtractionStatus,
        now: i64,
    ) -> Result<bool> {
        let transition = check_transition(from, to)?;
        let extra = match transition {
            Transition::Fail => ", attempts = attempts + 1",
            Transition::Requeue => ", attempts = 0, last_error = NULL",
            Transition::Reclaim => ", claimed_at = NULL",
            Transition::Claim | Transition::Complete => "",
        };
        let sql = format!(
            "UPDATE chunks SET extraction_status = ?1, updated_at = ?2, claim_token = NULL{} \
             WHERE id = ?3 AND extraction_status = ?4",
            extra
        );
        let result = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(now)
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_attempt(&self, claim: &Claim, error: &str, now: i64) -> Result<Option<u32>> {
        let attempts: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE chunks
            SET attempts = attempts + 1, last_error = ?, updated_at = ?
            WHERE id = ? AND extraction_status = 'processing' AND claim_token = ?
            RETURNING attempts
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(&claim.id)
        .bind(&claim.token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(attempts.map(|a| a as u32))
    }

    async fn complete_chunk(
        &self,
        claim: &Claim,
        signals: &DerivedSignals,
        now: i64,
    ) -> Result<bool> {
        let chunk_id = claim.id.as_str();
        let mut tx = self.pool.begin().await?;

        let transcript_id: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE chunks
            SET extraction_status = 'completed',
                entities_json = ?, topics_json = ?, tags_json = ?, lexical_json = ?,
                last_error = NULL, updated_at = ?, completed_at = ?, claim_token = NULL
            WHERE id = ? AND extraction_status = 'processing' AND claim_token = ?
            RETURNING transcript_id
            "#,
        )
        .bind(serde_json::to_string(&signals.entities)?)
        .bind(serde_json::to_string(&signals.topics)?)
        .bind(serde_json::to_string(&signals.qualification_tags)?)
        .bind(serde_json::to_string(&signals.lexical)?)
        .bind(now)
        .bind(now)
        .bind(chunk_id)
        .bind(&claim.token)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(transcript_id) = transcript_id else {
            tx.rollback().await?;
            return Ok(false);
        };

        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, transcript_id, dims, embedding)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                transcript_id = excluded.transcript_id,
                dims = excluded.dims,
                embedding = excluded.embedding
            "#,
        )
        .bind(chunk_id)
        .bind(&transcript_id)
        .bind(signals.embedding.len() as i64)
        .bind(vec_to_blob(&signals.embedding))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO chunks_fts (chunk_id, transcript_id, text) SELECT id, transcript_id, text FROM chunks WHERE id = ?",
        )
        .bind(chunk_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn fail_chunk(&self, claim: &Claim, error: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chunks
            SET extraction_status = 'failed', attempts = attempts + 1, last_error = ?,
                updated_at = ?, claim_token = NULL
            WHERE id = ? AND extraction_status = 'processing' AND claim_token = ?
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(&claim.id)
        .bind(&claim.token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn requeue_failed(&self, transcript_id: Option<&str>, now: i64) -> Result<RequeueCounts> {
        let mut tx = self.pool.begin().await?;

        let chunks = sqlx::query(
            r#"
            UPDATE chunks
            SET extraction_status = 'pending', attempts = 0, last_error = NULL, updated_at = ?1
            WHERE extraction_status = 'failed' AND (?2 IS NULL OR transcript_id = ?2)
            "#,
        )
        .bind(now)
        .bind(transcript_id)
        .execute(&mut *tx)
        .await?;

        let transcripts = sqlx::query(
            r#"
            UPDATE transcripts
            SET index_status = 'pending', index_attempts = 0, index_updated_at = ?1
            WHERE index_status = 'failed' AND deleted_at IS NULL AND (?2 IS NULL OR id = ?2)
            "#,
        )
        .bind(now)
        .bind(transcript_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RequeueCounts {
            transcripts: transcripts.rows_affected(),
            chunks: chunks.rows_affected(),
        })
    }

    async fn reclaim_stale(&self, cutoff: i64, now: i64) -> Result<Vec<ReclaimedClaim>> {
        let mut tx = self.pool.begin().await?;

        let transcript_rows = sqlx::query(
            r#"
            UPDATE transcripts
            SET index_status = 'pending',
                index_previous_status = 'processing',
                index_stuck_ms = ?1 - index_updated_at,
                index_reclaim_count = index_reclaim_count + 1,
                index_claim_token = NULL,
                index_updated_at = ?1
            WHERE index_status = 'processing' AND index_updated_at < ?2
            RETURNING id, index_stuck_ms
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let chunk_rows = sqlx::query(
            r#"
            UPDATE chunks
            SET extraction_status = 'pending',
                previous_status = 'processing',
                stuck_ms = ?1 - updated_at,
                reclaim_count = reclaim_count + 1,
                claimed_at = NULL,
                claim_token = NULL,
                updated_at = ?1
            WHERE extraction_status = 'processing' AND updated_at < ?2
            RETURNING id, transcript_id, stuck_ms
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut transcripts = Vec::with_capacity(transcript_rows.len());
        for row in &transcript_rows {
            let id: String = row.try_get("id")?;
            transcripts.push(ReclaimedClaim {
                kind: ClaimKind::Transcript,
                transcript_id: id.clone(),
                id,
                previous_status: ExtractionStatus::Processing,
                stuck_ms: row.try_get("index_stuck_ms")?,
            });
        }
        transcripts.sort_by(|a, b| a.id.cmp(&b.id));

        let mut chunks = Vec::with_capacity(chunk_rows.len());
        for row in &chunk_rows {
            chunks.push(ReclaimedClaim {
                kind: ClaimKind::Chunk,
                id: row.try_get("id")?,
                transcript_id: row.try_get("transcript_id")?,
                previous_status: ExtractionStatus::Processing,
                stuck_ms: row.try_get("stuck_ms")?,
            });
        }
        chunks.sort_by(|a, b| a.id.cmp(&b.id));

        transcripts.extend(chunks);
        Ok(transcripts)
    }

    async fn status_report(&self, transcript_id: Option<&str>) -> Result<StatusReport> {
        let mut report = StatusReport::default();

        let rows = sqlx::query(
            r#"
            SELECT index_status AS status, COUNT(*) AS n FROM transcripts
            WHERE deleted_at IS NULL AND (?1 IS NULL OR id = ?1)
            GROUP BY index_status
            "#,
        )
        .bind(transcript_id)
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            report.transcripts.add(parse_status(&status)?, n as u64);
        }

        let rows = sqlx::query(
            r#"
            SELECT c.extraction_status AS status, COUNT(*) AS n
            FROM chunks c JOIN transcripts t ON t.id = c.transcript_id
            WHERE t.deleted_at IS NULL AND (?1 IS NULL OR c.transcript_id = ?1)
            GROUP BY c.extraction_status
            "#,
        )
        .bind(transcript_id)
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            report.chunks.add(parse_status(&status)?, n as u64);
        }

        let rows = sqlx::query(
            r#"
            SELECT c.id, c.transcript_id, c.chunk_index, c.attempts, c.last_error, c.updated_at
            FROM chunks c JOIN transcripts t ON t.id = c.transcript_id
            WHERE c.extraction_status = 'failed' AND t.deleted_at IS NULL
              AND (?1 IS NULL OR c.transcript_id = ?1)
            ORDER BY c.transcript_id ASC, c.chunk_index ASC
            "#,
        )
        .bind(transcript_id)
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            let attempts: i64 = row.try_get("attempts")?;
            report.failed.push(FailedChunk {
                chunk_id: row.try_get("id")?,
                transcript_id: row.try_get("transcript_id")?,
                chunk_index: row.try_get("chunk_index")?,
                attempts: attempts as u32,
                last_error: row.try_get("last_error")?,
                updated_at: row.try_get("updated_at")?,
            });
        }

        Ok(report)
    }

    async fn candidates(&self, query: &CandidateQuery<'_>) -> Result<Vec<ChunkCandidate>> {
        if query.transcript_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT c.id, c.transcript_id, c.chunk_index, c.text, c.start_offset, c.end_offset,
                   c.hash, c.entities_json, c.topics_json, c.tags_json, c.lexical_json,
                   c.extraction_status, c.attempts, c.last_error, c.updated_at, c.claimed_at,
                   c.claim_token, c.completed_at, c.previous_status, c.stuck_ms, c.reclaim_count,
                   cv.embedding AS embedding, t.last_activity_at AS last_activity_at
            FROM chunks c
            JOIN transcripts t ON t.id = c.transcript_id
            LEFT JOIN chunk_vectors cv ON cv.chunk_id = c.id
            WHERE c.extraction_status = 'completed' AND t.deleted_at IS NULL
              AND c.transcript_id IN (
            "#,
        );
        let mut ids = qb.separated(", ");
        for id in query.transcript_ids {
            ids.push_bind(id);
        }
        qb.push(") ORDER BY c.transcript_id ASC, c.chunk_index ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut matched: Vec<(Chunk, i64)> = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk = chunk_from_row(row)?;
            if !query.topics.admits(&chunk.topics)
                || !query.qualification_tags.admits(&chunk.qualification_tags)
            {
                continue;
            }
            matched.push((chunk, row.try_get("last_activity_at")?));
        }
        if matched.is_empty() {
            return Ok(Vec::new());
        }

        let mut lexical: HashMap<String, f64> = HashMap::new();
        if let Some(expr) = fts_match_expr(query.text) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT chunk_id, bm25(chunks_fts) AS rank FROM chunks_fts WHERE chunks_fts MATCH ",
            );
            qb.push_bind(expr);
            qb.push(" AND transcript_id IN (");
            let mut ids = qb.separated(", ");
            for id in query.transcript_ids {
                ids.push_bind(id);
            }
            qb.push(")");

            for row in qb.build().fetch_all(&self.pool).await? {
                let rank: f64 = row.try_get("rank")?;
                // negate so higher = better
                lexical.insert(row.try_get("chunk_id")?, (-rank).max(0.0));
            }
        }

        Ok(matched
            .into_iter()
            .map(|(chunk, last_activity_at)| {
                let vector_similarity = query.embedding.map(|q| {
                    chunk
                        .embedding
                        .as_deref()
                        .map_or(0.0, |v| cosine_similarity(q, v) as f64)
                });
                let lexical_score = lexical.get(&chunk.id).copied().unwrap_or(0.0);
                ChunkCandidate {
                    chunk,
                    last_activity_at,
                    vector_similarity,
                    lexical_score,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fts_match_expr_quotes_terms() {
        assert_eq!(
            fts_match_expr("budget: \"CFO\" sign-off?").as_deref(),
            Some("\"budget\" OR \"cfo\" OR \"sign\" OR \"off\"")
        );
        assert_eq!(fts_match_expr("  ?! "), None);
    }
}
