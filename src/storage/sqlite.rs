use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use super::{StatusUpdate, Storage, StorageError};
use crate::audit::{HistoryEntry, NewHistoryEntry};
use crate::signature::types::{SignatureEvidence, SignatureRecord};
use crate::workflow::types::{Request, RequestId, RequestStatus, StepType, UserId};

/// SQLite-backed storage. Status writes and their signature share one transaction.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Connect, creating the database file if needed and optionally running migrations.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        auto_migrate: bool,
    ) -> Result<Self, StorageError> {
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        if !in_memory && !Sqlite::database_exists(database_url).await? {
            info!("Creating database at {}", database_url);
            Sqlite::create_database(database_url).await?;
        }

        // Each connection to an in-memory database is its own database.
        let max_connections = if in_memory { 1 } else { max_connections.max(1) };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        if auto_migrate {
            storage.migrate().await?;
        }
        Ok(storage)
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }
}

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StorageError::Corrupt(format!("bad timestamp '{value}': {err}")))
}

fn parse_field<T>(value: &str) -> Result<T, StorageError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|err: T::Err| StorageError::Corrupt(err.to_string()))
}

fn request_from_row(row: &SqliteRow) -> Result<Request, StorageError> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let method: String = row.try_get("signature_method")?;
    let transfer_type: String = row.try_get("transfer_type")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let submitted_at: Option<String> = row.try_get("submitted_at")?;

    Ok(Request {
        id: parse_field(&id)?,
        request_number: row.try_get("request_number")?,
        title: row.try_get("title")?,
        status: parse_field(&status)?,
        requestor_id: UserId::new(row.try_get::<String, _>("requestor_id")?),
        requestor_email: row.try_get("requestor_email")?,
        approver_id: row.try_get::<Option<String>, _>("approver_id")?.map(UserId::new),
        dta_id: row.try_get::<Option<String>, _>("dta_id")?.map(UserId::new),
        assigned_sme_id: row
            .try_get::<Option<String>, _>("assigned_sme_id")?
            .map(UserId::new),
        transfer_type: transfer_type.into(),
        classification: row.try_get("classification")?,
        signature_method: parse_field(&method)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        submitted_at: submitted_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn signature_from_row(row: &SqliteRow) -> Result<SignatureRecord, StorageError> {
    let id: String = row.try_get("id")?;
    let request_id: String = row.try_get("request_id")?;
    let step: String = row.try_get("step_type")?;
    let evidence: String = row.try_get("evidence")?;
    let created_at: String = row.try_get("created_at")?;

    let evidence: SignatureEvidence = serde_json::from_str(&evidence)
        .map_err(|err| StorageError::Corrupt(format!("signature evidence: {err}")))?;

    Ok(SignatureRecord {
        id: parse_field(&id)?,
        request_id: parse_field(&request_id)?,
        step: parse_field::<StepType>(&step)?,
        signer_id: UserId::new(row.try_get::<String, _>("signer_id")?),
        signer_email: row.try_get("signer_email")?,
        evidence,
        integrity_hash: row.try_get("integrity_hash")?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn history_from_row(row: &SqliteRow) -> Result<HistoryEntry, StorageError> {
    let request_id: String = row.try_get("request_id")?;
    let action: String = row.try_get("action")?;
    let ts: String = row.try_get("timestamp")?;
    Ok(HistoryEntry {
        id: row.try_get("id")?,
        request_id: parse_field(&request_id)?,
        action: action.into(),
        actor_email: row.try_get("actor_email")?,
        notes: row.try_get("notes")?,
        timestamp: parse_timestamp(&ts)?,
    })
}

async fn insert_signature_row(
    conn: &mut SqliteConnection,
    signature: &SignatureRecord,
) -> Result<(), StorageError> {
    let evidence = serde_json::to_string(&signature.evidence)
        .map_err(|err| StorageError::Corrupt(format!("signature evidence: {err}")))?;

    sqlx::query(
        r#"
        INSERT INTO signatures
            (id, request_id, step_type, signer_id, signer_email,
             method, evidence, integrity_hash, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(signature.id.to_string())
    .bind(signature.request_id.to_string())
    .bind(signature.step.as_str())
    .bind(signature.signer_id.as_str())
    .bind(&signature.signer_email)
    .bind(signature.method().as_str())
    .bind(evidence)
    .bind(&signature.integrity_hash)
    .bind(timestamp(signature.created_at))
    .execute(conn)
    .await
    .map_err(|err| match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::DuplicateSignature {
            request_id: signature.request_id,
            step: signature.step,
        },
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            StorageError::RequestNotFound(signature.request_id)
        }
        _ => StorageError::from(err),
    })?;
    Ok(())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn insert_request(&self, request: &Request) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO requests
                (id, request_number, title, status, requestor_id, requestor_email, approver_id,
                 dta_id, assigned_sme_id, transfer_type, classification, signature_method,
                 created_at, updated_at, submitted_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(request.id.to_string())
        .bind(&request.request_number)
        .bind(&request.title)
        .bind(request.status.as_str())
        .bind(request.requestor_id.as_str())
        .bind(&request.requestor_email)
        .bind(request.approver_id.as_ref().map(UserId::as_str))
        .bind(request.dta_id.as_ref().map(UserId::as_str))
        .bind(request.assigned_sme_id.as_ref().map(UserId::as_str))
        .bind(request.transfer_type.as_str())
        .bind(&request.classification)
        .bind(request.signature_method.as_str())
        .bind(timestamp(request.created_at))
        .bind(timestamp(request.updated_at))
        .bind(request.submitted_at.map(timestamp))
        .execute(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StorageError::DuplicateRequestNumber(request.request_number.clone())
            }
            _ => StorageError::from(err),
        })?;
        Ok(())
    }

    async fn read_request(&self, id: RequestId) -> Result<Option<Request>, StorageError> {
        let row = sqlx::query("SELECT * FROM requests WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn list_requests(&self) -> Result<Vec<Request>, StorageError> {
        let rows = sqlx::query("SELECT * FROM requests ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(request_from_row).collect()
    }

    async fn write_request_status(
        &self,
        update: &StatusUpdate,
        signature: Option<&SignatureRecord>,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE requests
            SET status = ?1,
                updated_at = ?2,
                approver_id = COALESCE(?3, approver_id),
                dta_id = COALESCE(?4, dta_id),
                assigned_sme_id = COALESCE(?5, assigned_sme_id),
                submitted_at = COALESCE(?6, submitted_at)
            WHERE id = ?7 AND status = ?8
            "#,
        )
        .bind(update.to.as_str())
        .bind(timestamp(update.updated_at))
        .bind(update.fields.approver_id.as_ref().map(UserId::as_str))
        .bind(update.fields.dta_id.as_ref().map(UserId::as_str))
        .bind(update.fields.assigned_sme_id.as_ref().map(UserId::as_str))
        .bind(update.fields.submitted_at.map(timestamp))
        .bind(update.request_id.to_string())
        .bind(update.expected_from.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let actual: Option<String> =
                sqlx::query_scalar("SELECT status FROM requests WHERE id = ?1")
                    .bind(update.request_id.to_string())
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            debug!(
                request_id = %update.request_id,
                expected = %update.expected_from,
                actual = ?actual,
                "Conditional status update matched no rows"
            );
            return match actual {
                None => Err(StorageError::RequestNotFound(update.request_id)),
                Some(status) => Err(StorageError::StatusMismatch {
                    request_id: update.request_id,
                    expected: update.expected_from,
                    actual: parse_field::<RequestStatus>(&status)?,
                }),
            };
        }

        if let Some(record) = signature {
            // Dropping the transaction on error rolls the status change back.
            insert_signature_row(&mut tx, record).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn insert_signature(&self, signature: &SignatureRecord) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await?;
        insert_signature_row(&mut conn, signature).await
    }

    async fn read_signature(&self, id: Uuid) -> Result<Option<SignatureRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM signatures WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(signature_from_row).transpose()
    }

    async fn signatures_for(&self, id: RequestId) -> Result<Vec<SignatureRecord>, StorageError> {
        let rows = sqlx::query("SELECT * FROM signatures WHERE request_id = ?1 ORDER BY seq ASC")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(signature_from_row).collect()
    }

    async fn insert_history(&self, entry: &NewHistoryEntry) -> Result<HistoryEntry, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO history (request_id, action, actor_email, notes, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(entry.request_id.to_string())
        .bind(entry.action.as_str())
        .bind(&entry.actor_email)
        .bind(entry.notes.as_deref())
        .bind(timestamp(entry.timestamp))
        .execute(&self.pool)
        .await?;

        Ok(HistoryEntry {
            id: result.last_insert_rowid(),
            request_id: entry.request_id,
            action: entry.action.clone(),
            actor_email: entry.actor_email.clone(),
            notes: entry.notes.clone(),
            timestamp: entry.timestamp,
        })
    }

    async fn history_for(&self, id: RequestId) -> Result<Vec<HistoryEntry>, StorageError> {
        let rows = sqlx::query("SELECT * FROM history WHERE request_id = ?1 ORDER BY id ASC")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(history_from_row).collect()
    }
}
