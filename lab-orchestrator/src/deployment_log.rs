//! Append-only deployment log.
//!
//! Records are ordered by `seq`, an autoincrement key, rather than by timestamp, so records
//! written within the same millisecond keep their append order.

use crate::error::{OrchestratorError, Result};
use crate::lab::{from_millis, now_millis, LabStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lab_provider::{DeploymentLogSink, LogCategory, ProviderError};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, Sqlite};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeploymentLogRecord {
    pub seq: i64,
    pub id: String,
    pub lab_id: String,
    #[schema(value_type = String, example = "provisioning")]
    pub category: LogCategory,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

pub(crate) async fn insert_log<'e, E>(
    executor: E,
    lab_id: &str,
    category: LogCategory,
    content: &str,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO deployment_logs (id, lab_id, category, content, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(lab_id)
    .bind(category.as_str())
    .bind(content)
    .bind(now_millis())
    .execute(executor)
    .await?;

    Ok(())
}

impl LabStore {
    pub async fn append_log(&self, lab_id: &str, category: LogCategory, content: &str) -> Result<()> {
        insert_log(self.pool(), lab_id, category, content).await
    }

    /// All records for a lab in append order.
    pub async fn list_logs(&self, lab_id: &str) -> Result<Vec<DeploymentLogRecord>> {
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM labs WHERE id = ?")
            .bind(lab_id)
            .fetch_optional(self.pool())
            .await?;
        if exists.is_none() {
            return Err(OrchestratorError::NotFound(format!("Lab {}", lab_id)));
        }

        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT * FROM deployment_logs WHERE lab_id = ? ORDER BY seq",
        )
        .bind(lab_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(DeploymentLogRecord::try_from).collect()
    }
}

#[async_trait]
impl DeploymentLogSink for LabStore {
    async fn append(
        &self,
        lab_id: &str,
        category: LogCategory,
        content: &str,
    ) -> lab_provider::Result<()> {
        self.append_log(lab_id, category, content)
            .await
            .map_err(|e| ProviderError::LogSink(e.to_string()))
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    seq: i64,
    id: String,
    lab_id: String,
    category: String,
    content: String,
    created_at: i64,
}

impl TryFrom<LogRow> for DeploymentLogRecord {
    type Error = OrchestratorError;

    fn try_from(row: LogRow) -> Result<Self> {
        Ok(Self {
            seq: row.seq,
            id: row.id,
            lab_id: row.lab_id,
            category: row
                .category
                .parse()
                .map_err(OrchestratorError::InvalidState)?,
            content: row.content,
            created_at: from_millis(row.created_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lab::CreateLabRequest;
    use crate::test_utils::create_test_db;

    #[tokio::test]
    async fn test_records_keep_append_order() {
        let store = LabStore::new(create_test_db().await);
        let lab = store
            .create_lab(CreateLabRequest {
                name: "ordered".to_string(),
                description: None,
                config_payload: None,
                vms: Vec::new(),
            })
            .await
            .unwrap();

        for i in 0..20 {
            store
                .append(&lab.id, LogCategory::Provisioning, &format!("line {}", i))
                .await
                .unwrap();
        }

        let logs = store.list_logs(&lab.id).await.unwrap();
        let contents: Vec<String> = logs.iter().map(|r| r.content.clone()).collect();
        let expected: Vec<String> = (0..20).map(|i| format!("line {}", i)).collect();
        assert_eq!(contents, expected);
        assert!(logs.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn test_logs_for_unknown_lab() {
        let store = LabStore::new(create_test_db().await);
        assert!(matches!(
            store.list_logs("nope").await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(matches!(
            store.append("nope", LogCategory::Error, "x").await,
            Err(ProviderError::LogSink(_))
        ));
    }
}
