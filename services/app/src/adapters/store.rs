//! services/app/src/adapters/store.rs
//!
//! The assessment store adapter, the concrete implementation of the
//! `AssessmentStore` port. Assessments and their child records are kept as
//! JSONB documents in PostgreSQL using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sqlx::{types::Json, FromRow, PgPool};
use tracing::warn;
use triage_core::domain::{DiagnosisRecord, NewAssessment, PredictionLink, Stored, XrayRecord};
use triage_core::ports::{AssessmentStore, PortError, PortResult};
use uuid::Uuid;

const DIAGNOSIS: &str = "diagnosis";
const XRAY: &str = "xray";
const BACKEND_PREDICTION: &str = "backendPrediction";

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A document store adapter that implements the `AssessmentStore` port.
#[derive(Clone)]
pub struct PgAssessmentStore {
    pool: PgPool,
}

impl PgAssessmentStore {
    /// Creates a new `PgAssessmentStore`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn insert_record<T: Serialize>(
        &self,
        assessment_id: Uuid,
        collection: &str,
        record: &T,
    ) -> PortResult<()> {
        let body = serde_json::to_value(record).map_err(|e| PortError::Unexpected(e.to_string()))?;
        sqlx::query(
            "INSERT INTO assessment_records (id, assessment_id, collection, body) VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(assessment_id)
        .bind(collection)
        .bind(Json(body))
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                PortError::NotFound(format!("Assessment {} not found", assessment_id))
            }
            _ => PortError::Unexpected(e.to_string()),
        })?;
        Ok(())
    }

    async fn list_records<T: DeserializeOwned>(
        &self,
        assessment_id: Uuid,
        collection: &str,
    ) -> PortResult<Vec<Stored<T>>> {
        let records = sqlx::query_as::<_, DocumentRecord>(
            "SELECT id, body, created_at FROM assessment_records \
             WHERE assessment_id = $1 AND collection = $2 ORDER BY created_at ASC, id ASC",
        )
        .bind(assessment_id)
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        Ok(records
            .into_iter()
            .filter_map(|r| {
                let id = r.id;
                r.to_domain().map_err(|e| {
                    warn!("Skipping unreadable {} record {}: {}", collection, id, e);
                })
                .ok()
            })
            .collect())
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct DocumentRecord {
    id: Uuid,
    body: Json<Value>,
    created_at: DateTime<Utc>,
}
impl DocumentRecord {
    fn to_domain<T: DeserializeOwned>(self) -> Result<Stored<T>, serde_json::Error> {
        Ok(Stored {
            id: self.id,
            created_at: self.created_at,
            body: serde_json::from_value(self.body.0)?,
        })
    }
}

//=========================================================================================
// `AssessmentStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl AssessmentStore for PgAssessmentStore {
    async fn create_assessment(&self, assessment: &NewAssessment) -> PortResult<Uuid> {
        let body =
            serde_json::to_value(assessment).map_err(|e| PortError::Unexpected(e.to_string()))?;
        let id: Uuid =
            sqlx::query_scalar::<_, Uuid>("INSERT INTO assessments (id, body) VALUES ($1, $2) RETURNING id")
                .bind(Uuid::new_v4())
                .bind(Json(body))
                .fetch_one(&self.pool)
                .await
                .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(id)
    }

    async fn assessment_exists(&self, assessment_id: Uuid) -> PortResult<bool> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM assessments WHERE id = $1)")
            .bind(assessment_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))
    }

    async fn add_diagnosis(&self, assessment_id: Uuid, record: &DiagnosisRecord) -> PortResult<()> {
        self.insert_record(assessment_id, DIAGNOSIS, record).await
    }

    async fn add_xray(&self, assessment_id: Uuid, record: &XrayRecord) -> PortResult<()> {
        self.insert_record(assessment_id, XRAY, record).await
    }

    async fn add_prediction_link(
        &self,
        assessment_id: Uuid,
        link: &PredictionLink,
    ) -> PortResult<()> {
        self.insert_record(assessment_id, BACKEND_PREDICTION, link).await
    }

    async fn list_xrays(&self, assessment_id: Uuid) -> PortResult<Vec<Stored<XrayRecord>>> {
        self.list_records(assessment_id, XRAY).await
    }

    async fn list_prediction_links(
        &self,
        assessment_id: Uuid,
    ) -> PortResult<Vec<Stored<PredictionLink>>> {
        self.list_records(assessment_id, BACKEND_PREDICTION).await
    }
}
