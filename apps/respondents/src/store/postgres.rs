//! PostgreSQL store. Schema lives in `migrations/0001_respondents.sql`.
//!
//! Each `StoreTx` wraps one database transaction. Lock methods use
//! `SELECT ... FOR UPDATE` so merges for the same user serialize on the user row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::Postgres;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Transaction};
use uuid::Uuid;

use super::{Store, StoreResult, StoreTx};
use crate::errors::EngineError;
use crate::models::consent::{ConsentRecord, DataCategory, NewConsentRecord};
use crate::models::context::EntryPoint;
use crate::models::event::{NewRespondentEvent, RespondentEvent};
use crate::models::participation::SurveyParticipation;
use crate::models::requirements::{CategoryRequirement, LocationPrecision, SurveyDataRequirement};
use crate::models::respondent::{ExplicitAttributes, PermissionedAttributes, Respondent};
use crate::models::user::User;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

/// Maps unique-constraint violations to `Conflict`; everything else stays a database error.
fn conflict_on_unique(e: sqlx::Error, message: impl FnOnce() -> String) -> EngineError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => EngineError::Conflict(message()),
        _ => EngineError::Database(e),
    }
}

fn parse_source(raw: Option<String>) -> StoreResult<Option<EntryPoint>> {
    raw.map(|s| s.parse()).transpose()
}

fn to_i32(value: u32, field: &str) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| EngineError::Validation(format!("{field} is out of range")))
}

fn to_u32(value: i32, field: &str) -> StoreResult<u32> {
    u32::try_from(value)
        .map_err(|_| anyhow::anyhow!("Column {field} holds a negative value ({value})").into())
}

fn to_i64(value: u64, field: &str) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| EngineError::Validation(format!("{field} is out of range")))
}

fn to_u64(value: i64, field: &str) -> StoreResult<u64> {
    u64::try_from(value)
        .map_err(|_| anyhow::anyhow!("Column {field} holds a negative value ({value})").into())
}

// ────────────────────────────────────────────────────────────────────────────
// Row types
// ────────────────────────────────────────────────────────────────────────────

#[derive(FromRow)]
struct RespondentRow {
    id: Uuid,
    user_id: Option<Uuid>,
    session_token: String,
    fingerprint: Option<String>,
    explicit_attributes: Json<ExplicitAttributes>,
    permissioned_attributes: Json<PermissionedAttributes>,
    is_anonymous: bool,
    is_active: bool,
    is_merged: bool,
    merged_into_id: Option<Uuid>,
    first_seen_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    is_deleted: bool,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<RespondentRow> for Respondent {
    fn from(row: RespondentRow) -> Self {
        Respondent {
            id: row.id,
            user_id: row.user_id,
            session_token: row.session_token,
            fingerprint: row.fingerprint,
            explicit: row.explicit_attributes.0,
            permissioned: row.permissioned_attributes.0,
            is_anonymous: row.is_anonymous,
            is_active: row.is_active,
            is_merged: row.is_merged,
            merged_into_id: row.merged_into_id,
            first_seen_at: row.first_seen_at,
            last_activity_at: row.last_activity_at,
            is_deleted: row.is_deleted,
            deleted_at: row.deleted_at,
        }
    }
}

#[derive(FromRow)]
struct ConsentRow {
    id: Uuid,
    seq: i64,
    respondent_id: Uuid,
    survey_id: Option<Uuid>,
    category: String,
    granted: bool,
    recorded_at: DateTime<Utc>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    source: Option<String>,
    schema_version: String,
    details: Option<Value>,
}

impl TryFrom<ConsentRow> for ConsentRecord {
    type Error = EngineError;

    fn try_from(row: ConsentRow) -> Result<Self, Self::Error> {
        Ok(ConsentRecord {
            id: row.id,
            seq: row.seq,
            respondent_id: row.respondent_id,
            survey_id: row.survey_id,
            category: row.category.parse()?,
            granted: row.granted,
            recorded_at: row.recorded_at,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            source: parse_source(row.source)?,
            schema_version: row.schema_version,
            details: row.details,
        })
    }
}

#[derive(FromRow)]
struct EventRow {
    id: Uuid,
    seq: i64,
    respondent_id: Uuid,
    kind: String,
    payload: Value,
    occurred_at: DateTime<Utc>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    source: Option<String>,
}

impl TryFrom<EventRow> for RespondentEvent {
    type Error = EngineError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(RespondentEvent {
            id: row.id,
            seq: row.seq,
            respondent_id: row.respondent_id,
            kind: row.kind.parse()?,
            payload: row.payload,
            occurred_at: row.occurred_at,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            source: parse_source(row.source)?,
        })
    }
}

#[derive(FromRow)]
struct RequirementsRow {
    survey_id: Uuid,
    categories: Json<Vec<CategoryRequirement>>,
    location_precision: Option<Json<LocationPrecision>>,
    data_collection_notice: Option<String>,
    privacy_policy_url: Option<String>,
    terms_of_service_url: Option<String>,
    data_retention_days: i32,
    allow_data_export: bool,
    allow_data_deletion: bool,
    updated_at: DateTime<Utc>,
}

impl From<RequirementsRow> for SurveyDataRequirement {
    fn from(row: RequirementsRow) -> Self {
        SurveyDataRequirement {
            survey_id: row.survey_id,
            categories: row.categories.0,
            location_precision: row.location_precision.map(|p| p.0),
            data_collection_notice: row.data_collection_notice,
            privacy_policy_url: row.privacy_policy_url,
            terms_of_service_url: row.terms_of_service_url,
            data_retention_days: row.data_retention_days,
            allow_data_export: row.allow_data_export,
            allow_data_deletion: row.allow_data_deletion,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct ParticipationRow {
    id: Uuid,
    respondent_id: Uuid,
    survey_id: Uuid,
    status: String,
    answered_count: i32,
    total_questions: i32,
    progress_percentage: f64,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    abandoned_at: Option<DateTime<Utc>>,
    time_spent_seconds: i64,
    completion_source: Option<String>,
}

impl TryFrom<ParticipationRow> for SurveyParticipation {
    type Error = EngineError;

    fn try_from(row: ParticipationRow) -> Result<Self, Self::Error> {
        Ok(SurveyParticipation {
            id: row.id,
            respondent_id: row.respondent_id,
            survey_id: row.survey_id,
            status: row.status.parse()?,
            answered_count: to_u32(row.answered_count, "answered_count")?,
            total_questions: to_u32(row.total_questions, "total_questions")?,
            progress_percentage: row.progress_percentage,
            started_at: row.started_at,
            last_activity_at: row.last_activity_at,
            completed_at: row.completed_at,
            abandoned_at: row.abandoned_at,
            time_spent_seconds: to_u64(row.time_spent_seconds, "time_spent_seconds")?,
            completion_source: parse_source(row.completion_source)?,
        })
    }
}

const RESPONDENT_COLUMNS: &str = "id, user_id, session_token, fingerprint, explicit_attributes, \
     permissioned_attributes, is_anonymous, is_active, is_merged, merged_into_id, \
     first_seen_at, last_activity_at, is_deleted, deleted_at";

const CONSENT_COLUMNS: &str = "id, seq, respondent_id, survey_id, category, granted, recorded_at, \
     ip_address, user_agent, source, schema_version, details";

const EVENT_COLUMNS: &str =
    "id, seq, respondent_id, kind, payload, occurred_at, ip_address, user_agent, source";

const PARTICIPATION_COLUMNS: &str = "id, respondent_id, survey_id, status, answered_count, \
     total_questions, progress_percentage, started_at, last_activity_at, completed_at, \
     abandoned_at, time_spent_seconds, completion_source";

#[async_trait]
impl StoreTx for PgTx {
    async fn insert_user(&mut self, user: &User) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, username, telegram_chat_id, is_active, is_deleted, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(user.telegram_chat_id)
        .bind(user.is_active)
        .bind(user.is_deleted)
        .bind(user.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                "A user with the same identifier already exists".to_string()
            })
        })?;
        Ok(())
    }

    async fn get_user(&mut self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?)
    }

    async fn lock_user(&mut self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?,
        )
    }

    async fn insert_respondent(&mut self, respondent: &Respondent) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO respondents
                (id, user_id, session_token, fingerprint, explicit_attributes,
                 permissioned_attributes, is_anonymous, is_active, is_merged, merged_into_id,
                 first_seen_at, last_activity_at, is_deleted, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(respondent.id)
        .bind(respondent.user_id)
        .bind(&respondent.session_token)
        .bind(&respondent.fingerprint)
        .bind(Json(&respondent.explicit))
        .bind(Json(&respondent.permissioned))
        .bind(respondent.is_anonymous)
        .bind(respondent.is_active)
        .bind(respondent.is_merged)
        .bind(respondent.merged_into_id)
        .bind(respondent.first_seen_at)
        .bind(respondent.last_activity_at)
        .bind(respondent.is_deleted)
        .bind(respondent.deleted_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!(
                    "Session token '{}' is already in use",
                    respondent.session_token
                )
            })
        })?;
        Ok(())
    }

    async fn get_respondent(&mut self, id: Uuid) -> StoreResult<Option<Respondent>> {
        let row = sqlx::query_as::<_, RespondentRow>(&format!(
            "SELECT {RESPONDENT_COLUMNS} FROM respondents WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Respondent::from))
    }

    async fn lock_respondent(&mut self, id: Uuid) -> StoreResult<Option<Respondent>> {
        let row = sqlx::query_as::<_, RespondentRow>(&format!(
            "SELECT {RESPONDENT_COLUMNS} FROM respondents WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Respondent::from))
    }

    async fn find_respondent_by_session(
        &mut self,
        session_token: &str,
    ) -> StoreResult<Option<Respondent>> {
        let row = sqlx::query_as::<_, RespondentRow>(&format!(
            "SELECT {RESPONDENT_COLUMNS} FROM respondents WHERE session_token = $1"
        ))
        .bind(session_token)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Respondent::from))
    }

    async fn find_respondents_by_fingerprint(
        &mut self,
        fingerprint: &str,
    ) -> StoreResult<Vec<Respondent>> {
        let rows = sqlx::query_as::<_, RespondentRow>(&format!(
            "SELECT {RESPONDENT_COLUMNS} FROM respondents \
             WHERE fingerprint = $1 AND NOT is_deleted \
             ORDER BY last_activity_at DESC, id"
        ))
        .bind(fingerprint)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(Respondent::from).collect())
    }

    async fn respondents_for_user(
        &mut self,
        user_id: Uuid,
        lock: bool,
    ) -> StoreResult<Vec<Respondent>> {
        let suffix = if lock { " FOR UPDATE" } else { "" };
        let rows = sqlx::query_as::<_, RespondentRow>(&format!(
            "SELECT {RESPONDENT_COLUMNS} FROM respondents \
             WHERE user_id = $1 AND NOT is_merged AND NOT is_deleted \
             ORDER BY id{suffix}"
        ))
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(Respondent::from).collect())
    }

    async fn merged_sources(&mut self, target: Uuid) -> StoreResult<Vec<Respondent>> {
        let rows = sqlx::query_as::<_, RespondentRow>(&format!(
            "SELECT {RESPONDENT_COLUMNS} FROM respondents WHERE merged_into_id = $1 ORDER BY id"
        ))
        .bind(target)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(Respondent::from).collect())
    }

    async fn update_respondent(&mut self, respondent: &Respondent) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE respondents SET
                user_id = $2, fingerprint = $3, explicit_attributes = $4,
                permissioned_attributes = $5, is_anonymous = $6, is_active = $7,
                is_merged = $8, merged_into_id = $9, last_activity_at = $10,
                is_deleted = $11, deleted_at = $12
            WHERE id = $1
            "#,
        )
        .bind(respondent.id)
        .bind(respondent.user_id)
        .bind(&respondent.fingerprint)
        .bind(Json(&respondent.explicit))
        .bind(Json(&respondent.permissioned))
        .bind(respondent.is_anonymous)
        .bind(respondent.is_active)
        .bind(respondent.is_merged)
        .bind(respondent.merged_into_id)
        .bind(respondent.last_activity_at)
        .bind(respondent.is_deleted)
        .bind(respondent.deleted_at)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::respondent_not_found(respondent.id));
        }
        Ok(())
    }

    async fn append_consent(&mut self, record: NewConsentRecord) -> StoreResult<ConsentRecord> {
        let row = sqlx::query_as::<_, ConsentRow>(&format!(
            r#"
            INSERT INTO consent_records
                (id, respondent_id, survey_id, category, granted, recorded_at,
                 ip_address, user_agent, source, schema_version, details)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {CONSENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(record.respondent_id)
        .bind(record.survey_id)
        .bind(record.category.to_string())
        .bind(record.granted)
        .bind(record.recorded_at)
        .bind(&record.ip_address)
        .bind(&record.user_agent)
        .bind(record.source.map(|s| s.as_str()))
        .bind(&record.schema_version)
        .bind(&record.details)
        .fetch_one(&mut *self.tx)
        .await?;
        row.try_into()
    }

    async fn consent_records(
        &mut self,
        respondent_ids: &[Uuid],
        category: Option<&DataCategory>,
    ) -> StoreResult<Vec<ConsentRecord>> {
        let rows = sqlx::query_as::<_, ConsentRow>(&format!(
            "SELECT {CONSENT_COLUMNS} FROM consent_records \
             WHERE respondent_id = ANY($1) AND ($2::TEXT IS NULL OR category = $2) \
             ORDER BY recorded_at, seq"
        ))
        .bind(respondent_ids)
        .bind(category.map(|c| c.to_string()))
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(ConsentRecord::try_from).collect()
    }

    async fn append_event(&mut self, event: NewRespondentEvent) -> StoreResult<RespondentEvent> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            INSERT INTO respondent_events
                (id, respondent_id, kind, payload, occurred_at, ip_address, user_agent, source)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(event.respondent_id)
        .bind(event.kind.as_str())
        .bind(&event.payload)
        .bind(event.occurred_at)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(event.source.map(|s| s.as_str()))
        .fetch_one(&mut *self.tx)
        .await?;
        row.try_into()
    }

    async fn events(&mut self, respondent_ids: &[Uuid]) -> StoreResult<Vec<RespondentEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM respondent_events \
             WHERE respondent_id = ANY($1) ORDER BY occurred_at, seq"
        ))
        .bind(respondent_ids)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(RespondentEvent::try_from).collect()
    }

    async fn upsert_requirements(
        &mut self,
        requirements: &SurveyDataRequirement,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO survey_data_requirements
                (survey_id, categories, location_precision, data_collection_notice,
                 privacy_policy_url, terms_of_service_url, data_retention_days,
                 allow_data_export, allow_data_deletion, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (survey_id) DO UPDATE SET
                categories = EXCLUDED.categories,
                location_precision = EXCLUDED.location_precision,
                data_collection_notice = EXCLUDED.data_collection_notice,
                privacy_policy_url = EXCLUDED.privacy_policy_url,
                terms_of_service_url = EXCLUDED.terms_of_service_url,
                data_retention_days = EXCLUDED.data_retention_days,
                allow_data_export = EXCLUDED.allow_data_export,
                allow_data_deletion = EXCLUDED.allow_data_deletion,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(requirements.survey_id)
        .bind(Json(&requirements.categories))
        .bind(requirements.location_precision.map(Json))
        .bind(&requirements.data_collection_notice)
        .bind(&requirements.privacy_policy_url)
        .bind(&requirements.terms_of_service_url)
        .bind(requirements.data_retention_days)
        .bind(requirements.allow_data_export)
        .bind(requirements.allow_data_deletion)
        .bind(requirements.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_requirements(
        &mut self,
        survey_id: Uuid,
    ) -> StoreResult<Option<SurveyDataRequirement>> {
        let row = sqlx::query_as::<_, RequirementsRow>(
            "SELECT * FROM survey_data_requirements WHERE survey_id = $1",
        )
        .bind(survey_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(SurveyDataRequirement::from))
    }

    async fn insert_participation(
        &mut self,
        participation: &SurveyParticipation,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO survey_participations
                (id, respondent_id, survey_id, status, answered_count, total_questions,
                 progress_percentage, started_at, last_activity_at, completed_at,
                 abandoned_at, time_spent_seconds, completion_source)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(participation.id)
        .bind(participation.respondent_id)
        .bind(participation.survey_id)
        .bind(participation.status.as_str())
        .bind(to_i32(participation.answered_count, "answered_count")?)
        .bind(to_i32(participation.total_questions, "total_questions")?)
        .bind(participation.progress_percentage)
        .bind(participation.started_at)
        .bind(participation.last_activity_at)
        .bind(participation.completed_at)
        .bind(participation.abandoned_at)
        .bind(to_i64(participation.time_spent_seconds, "time_spent_seconds")?)
        .bind(participation.completion_source.map(|s| s.as_str()))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!(
                    "Respondent {} already participates in survey {}",
                    participation.respondent_id, participation.survey_id
                )
            })
        })?;
        Ok(())
    }

    async fn update_participation(
        &mut self,
        participation: &SurveyParticipation,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE survey_participations SET
                status = $2, answered_count = $3, progress_percentage = $4,
                last_activity_at = $5, completed_at = $6, abandoned_at = $7,
                time_spent_seconds = $8, completion_source = $9
            WHERE id = $1
            "#,
        )
        .bind(participation.id)
        .bind(participation.status.as_str())
        .bind(to_i32(participation.answered_count, "answered_count")?)
        .bind(participation.progress_percentage)
        .bind(participation.last_activity_at)
        .bind(participation.completed_at)
        .bind(participation.abandoned_at)
        .bind(to_i64(participation.time_spent_seconds, "time_spent_seconds")?)
        .bind(participation.completion_source.map(|s| s.as_str()))
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!(
                "Participation {} not found",
                participation.id
            )));
        }
        Ok(())
    }

    async fn participations(
        &mut self,
        respondent_ids: &[Uuid],
        survey_id: Option<Uuid>,
    ) -> StoreResult<Vec<SurveyParticipation>> {
        let rows = sqlx::query_as::<_, ParticipationRow>(&format!(
            "SELECT {PARTICIPATION_COLUMNS} FROM survey_participations \
             WHERE respondent_id = ANY($1) AND ($2::UUID IS NULL OR survey_id = $2) \
             ORDER BY last_activity_at DESC"
        ))
        .bind(respondent_ids)
        .bind(survey_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(SurveyParticipation::try_from).collect()
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
