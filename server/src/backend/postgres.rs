//! PostgreSQL document store.
//!
//! Documents live in one `documents` table as `jsonb`, keyed by
//! `(database, collection, doc_key)` where `doc_key` is the canonical JSON
//! text of `_id`. Shared transactions run at `REPEATABLE READ`, so two
//! transactions writing the same row fail with a serialization error that
//! maps to [`BackendError::Rollback`].

use super::{
    BackendResult, Backend, Checkpoint, ExclusiveTransaction, InternalId, WriteTransaction,
};
use crate::error::BackendError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oplog_engine::{as_document, DatabaseName, Document, DocumentKey, Namespace};
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;

/// [`Backend`] over a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    /// Connect a new pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> BackendResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> BackendResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn begin(&self, _namespace: &Namespace) -> BackendResult<Box<dyn WriteTransaction>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgTransaction { tx: Some(tx) }))
    }

    async fn begin_exclusive(&self) -> BackendResult<Box<dyn ExclusiveTransaction>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("LOCK TABLE documents IN EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgTransaction { tx: Some(tx) }))
    }

    async fn load_checkpoint(&self) -> BackendResult<Option<Checkpoint>> {
        let row: Option<(i64, i64, DateTime<Utc>)> =
            sqlx::query_as("SELECT ts, hash, updated_at FROM oplog_checkpoint WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(ts, hash, updated_at)| Checkpoint {
            ts: ts as u64,
            hash,
            updated_at,
        }))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> BackendResult<()> {
        sqlx::query(
            r#"
            INSERT INTO oplog_checkpoint (id, ts, hash, updated_at)
            VALUES (1, $1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                ts = EXCLUDED.ts,
                hash = EXCLUDED.hash,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(checkpoint.ts as i64)
        .bind(checkpoint.hash)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// An open PostgreSQL transaction. `None` once committed.
struct PgTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgTransaction {
    fn conn(&mut self) -> BackendResult<&mut PgConnection> {
        self.tx
            .as_deref_mut()
            .ok_or(BackendError::TransactionFinished)
    }
}

#[async_trait]
impl WriteTransaction for PgTransaction {
    async fn find_ids_by_keys(
        &mut self,
        namespace: &Namespace,
        keys: &[DocumentKey],
    ) -> BackendResult<HashMap<DocumentKey, InternalId>> {
        let by_canonical: HashMap<String, &DocumentKey> =
            keys.iter().map(|k| (k.canonical(), k)).collect();
        let canonical: Vec<String> = by_canonical.keys().cloned().collect();

        let rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT did, doc_key FROM documents
            WHERE database = $1 AND collection = $2 AND doc_key = ANY($3)
            "#,
        )
        .bind(&namespace.database)
        .bind(&namespace.collection)
        .bind(&canonical[..])
        .fetch_all(self.conn()?)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(did, doc_key)| {
                by_canonical
                    .get(&doc_key)
                    .map(|key| ((*key).clone(), did))
            })
            .collect())
    }

    async fn fetch_documents(
        &mut self,
        namespace: &Namespace,
        ids: &[InternalId],
    ) -> BackendResult<HashMap<InternalId, Document>> {
        let rows: Vec<(i64, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT did, body FROM documents
            WHERE database = $1 AND collection = $2 AND did = ANY($3)
            "#,
        )
        .bind(&namespace.database)
        .bind(&namespace.collection)
        .bind(ids)
        .fetch_all(self.conn()?)
        .await?;

        rows.into_iter()
            .map(|(did, body)| {
                as_document(body)
                    .map(|doc| (did, doc))
                    .map_err(|e| BackendError::Corrupt(format!("row {did}: {e}")))
            })
            .collect()
    }

    async fn delete_by_ids(
        &mut self,
        namespace: &Namespace,
        ids: &[InternalId],
    ) -> BackendResult<u64> {
        let result = sqlx::query(
            "DELETE FROM documents WHERE database = $1 AND collection = $2 AND did = ANY($3)",
        )
        .bind(&namespace.database)
        .bind(&namespace.collection)
        .bind(ids)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_documents(
        &mut self,
        namespace: &Namespace,
        documents: Vec<Document>,
    ) -> BackendResult<()> {
        let mut keys = Vec::with_capacity(documents.len());
        let mut bodies = Vec::with_capacity(documents.len());
        for doc in documents {
            let key = DocumentKey::of(&doc)
                .ok_or_else(|| BackendError::Corrupt("document without _id".to_string()))?;
            keys.push(key.canonical());
            bodies.push(serde_json::Value::Object(doc));
        }

        sqlx::query(
            r#"
            INSERT INTO documents (database, collection, doc_key, body)
            SELECT $1, $2, k, b FROM UNNEST($3::text[], $4::jsonb[]) AS t(k, b)
            "#,
        )
        .bind(&namespace.database)
        .bind(&namespace.collection)
        .bind(&keys[..])
        .bind(&bodies[..])
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn commit(&mut self) -> BackendResult<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Err(BackendError::TransactionFinished),
        }
    }
}

#[async_trait]
impl ExclusiveTransaction for PgTransaction {
    async fn drop_collection(&mut self, namespace: &Namespace) -> BackendResult<u64> {
        let result = sqlx::query("DELETE FROM documents WHERE database = $1 AND collection = $2")
            .bind(&namespace.database)
            .bind(&namespace.collection)
            .execute(self.conn()?)
            .await?;
        Ok(result.rows_affected())
    }

    async fn drop_database(&mut self, database: &DatabaseName) -> BackendResult<u64> {
        let result = sqlx::query("DELETE FROM documents WHERE database = $1")
            .bind(database)
            .execute(self.conn()?)
            .await?;
        Ok(result.rows_affected())
    }

    fn as_write(&mut self) -> &mut dyn WriteTransaction {
        self
    }
}
