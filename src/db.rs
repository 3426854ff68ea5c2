//! Optional forwarding of extracted device records to PostgreSQL

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Database connection pool and operations
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    table: String,
}

impl Database {
    /// Create a new database connection pool writing into `table`
    pub async fn new(connection_string: &str, table: &str) -> Result<Self> {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(AppError::DatabaseError(format!("Invalid table name: {table}")));
        }

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect(connection_string)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {}", e)))?;

        info!(table = %table, "Database connection pool established");
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    /// Create the records table if it does not exist yet
    pub async fn ensure_schema(&self) -> Result<()> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id UUID PRIMARY KEY,
                home_id TEXT NOT NULL,
                document JSONB NOT NULL,
                received_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert a batch of records for one device in a single transaction
    pub async fn insert_documents(&self, home_id: &str, documents: &[Value]) -> Result<usize> {
        if documents.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "INSERT INTO {} (id, home_id, document) VALUES ($1, $2, $3)",
            self.table
        );

        let mut tx = self.pool.begin().await?;
        for document in documents {
            sqlx::query(&sql)
                .bind(Uuid::new_v4())
                .bind(home_id)
                .bind(Json(document))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(count = documents.len(), home_id = %home_id, "Inserted device records");
        Ok(documents.len())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Read every top-level `*.json` file in `dir` as a stream of JSON objects.
///
/// Each object is stamped with the time it was received. Decoding stops at
/// the first bad record of a file; the rest of that file is skipped.
pub fn collect_documents(dir: &Path, received_at: DateTime<Utc>) -> std::io::Result<Vec<Value>> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    entries.sort();

    let mut documents = Vec::new();
    for path in entries {
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Failed to open JSON file");
                continue;
            }
        };

        let stream = serde_json::Deserializer::from_reader(BufReader::new(file))
            .into_iter::<Map<String, Value>>();
        for record in stream {
            match record {
                Ok(mut record) => {
                    record.insert(
                        "db_server_received_at_utc".to_string(),
                        Value::String(received_at.to_rfc3339()),
                    );
                    record.insert(
                        "db_server_received_at_timestamp".to_string(),
                        Value::from(received_at.timestamp()),
                    );
                    documents.push(Value::Object(record));
                }
                Err(e) => {
                    warn!(
                        file = %path.display(),
                        error = %e,
                        "JSON decode error, skipping rest of file"
                    );
                    break;
                }
            }
        }
    }

    Ok(documents)
}
