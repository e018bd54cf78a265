use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index if missing. Safe to run repeatedly.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Transcripts double as the indexing work queue (index_status = 'pending')
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transcripts (
            id TEXT PRIMARY KEY,
            title TEXT,
            rep_id TEXT,
            team_id TEXT,
            raw_text TEXT NOT NULL,
            text_hash TEXT NOT NULL,
            analysis_status TEXT NOT NULL DEFAULT 'transcribed',
            index_status TEXT NOT NULL DEFAULT 'pending',
            index_attempts INTEGER NOT NULL DEFAULT 0,
            index_updated_at INTEGER NOT NULL,
            index_previous_status TEXT,
            index_stuck_ms INTEGER,
            index_reclaim_count INTEGER NOT NULL DEFAULT 0,
            index_claim_token TEXT,
            last_activity_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            deleted_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Derived signals are NULL / empty until extraction_status = 'completed'
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            transcript_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            hash TEXT NOT NULL,
            entities_json TEXT NOT NULL DEFAULT '[]',
            topics_json TEXT NOT NULL DEFAULT '[]',
            tags_json TEXT NOT NULL DEFAULT '[]',
            lexical_json TEXT,
            extraction_status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            updated_at INTEGER NOT NULL,
            claimed_at INTEGER,
            claim_token TEXT,
            completed_at INTEGER,
            previous_status TEXT,
            stuck_ms INTEGER,
            reclaim_count INTEGER NOT NULL DEFAULT 0,
            UNIQUE(transcript_id, chunk_index),
            FOREIGN KEY (transcript_id) REFERENCES transcripts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            transcript_id TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                transcript_id UNINDEXED,
                text,
                tokenize = 'porter unicode61'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_transcript_id ON chunks(transcript_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_status ON chunks(extraction_status, updated_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_transcripts_queue ON transcripts(index_status, index_updated_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
