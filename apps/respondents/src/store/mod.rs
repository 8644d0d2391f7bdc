//! Storage seam.
//!
//! Every engine operation opens one [`StoreTx`], performs all of its reads and
//! writes through it, and commits at the end. Dropping a transaction without
//! committing discards every write made through it.
//!
//! Ledger tables (consent records, respondent events) only ever see appends;
//! there is deliberately no update or delete method for them.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::EngineError;
use crate::models::consent::{ConsentRecord, DataCategory, NewConsentRecord};
use crate::models::event::{NewRespondentEvent, RespondentEvent};
use crate::models::participation::SurveyParticipation;
use crate::models::requirements::SurveyDataRequirement;
use crate::models::respondent::Respondent;
use crate::models::user::User;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type StoreResult<T> = Result<T, EngineError>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;

    /// Cheap reachability check used by the health check.
    async fn ping(&self) -> StoreResult<()>;

    fn backend_name(&self) -> &'static str;
}

#[async_trait]
pub trait StoreTx: Send {
    // ---- users ----

    /// Fails with `Conflict` if any identifier is already taken.
    async fn insert_user(&mut self, user: &User) -> StoreResult<()>;

    async fn get_user(&mut self, id: Uuid) -> StoreResult<Option<User>>;

    /// Reads the user and holds an exclusive lock on it until commit/rollback.
    async fn lock_user(&mut self, id: Uuid) -> StoreResult<Option<User>>;

    // ---- respondents ----

    /// Fails with `Conflict` if the session token is already taken.
    async fn insert_respondent(&mut self, respondent: &Respondent) -> StoreResult<()>;

    async fn get_respondent(&mut self, id: Uuid) -> StoreResult<Option<Respondent>>;

    async fn lock_respondent(&mut self, id: Uuid) -> StoreResult<Option<Respondent>>;

    async fn find_respondent_by_session(
        &mut self,
        session_token: &str,
    ) -> StoreResult<Option<Respondent>>;

    /// Non-deleted respondents carrying `fingerprint`, most recently active first.
    async fn find_respondents_by_fingerprint(
        &mut self,
        fingerprint: &str,
    ) -> StoreResult<Vec<Respondent>>;

    /// Non-merged, non-deleted respondents linked to `user_id`, optionally locked.
    async fn respondents_for_user(
        &mut self,
        user_id: Uuid,
        lock: bool,
    ) -> StoreResult<Vec<Respondent>>;

    /// Respondents whose `merged_into_id` is exactly `target`.
    async fn merged_sources(&mut self, target: Uuid) -> StoreResult<Vec<Respondent>>;

    async fn update_respondent(&mut self, respondent: &Respondent) -> StoreResult<()>;

    // ---- consent ledger ----

    async fn append_consent(&mut self, record: NewConsentRecord) -> StoreResult<ConsentRecord>;

    /// Records filed against any of `respondent_ids`, ordered by `(recorded_at, seq)`.
    async fn consent_records(
        &mut self,
        respondent_ids: &[Uuid],
        category: Option<&DataCategory>,
    ) -> StoreResult<Vec<ConsentRecord>>;

    // ---- event log ----

    async fn append_event(&mut self, event: NewRespondentEvent) -> StoreResult<RespondentEvent>;

    /// Events filed against any of `respondent_ids`, ordered by `(occurred_at, seq)`.
    async fn events(&mut self, respondent_ids: &[Uuid]) -> StoreResult<Vec<RespondentEvent>>;

    // ---- survey data requirements ----

    async fn upsert_requirements(&mut self, requirements: &SurveyDataRequirement)
        -> StoreResult<()>;

    async fn get_requirements(
        &mut self,
        survey_id: Uuid,
    ) -> StoreResult<Option<SurveyDataRequirement>>;

    // ---- survey participation ----

    /// Fails with `Conflict` if the (respondent, survey) pair already exists.
    async fn insert_participation(&mut self, participation: &SurveyParticipation)
        -> StoreResult<()>;

    async fn update_participation(&mut self, participation: &SurveyParticipation)
        -> StoreResult<()>;

    async fn participations(
        &mut self,
        respondent_ids: &[Uuid],
        survey_id: Option<Uuid>,
    ) -> StoreResult<Vec<SurveyParticipation>>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}
