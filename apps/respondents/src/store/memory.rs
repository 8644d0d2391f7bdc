//! In-memory store, used by tests and for embedding without a database.
//!
//! One mutex guards the whole state. A transaction holds the guard for its
//! whole lifetime and works on a private copy that replaces the shared state
//! on commit, so transactions are serializable and rollback is a drop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Store, StoreResult, StoreTx};
use crate::errors::EngineError;
use crate::models::consent::{ConsentRecord, DataCategory, NewConsentRecord};
use crate::models::event::{NewRespondentEvent, RespondentEvent};
use crate::models::participation::SurveyParticipation;
use crate::models::requirements::SurveyDataRequirement;
use crate::models::respondent::Respondent;
use crate::models::user::User;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    respondents: HashMap<Uuid, Respondent>,
    consents: Vec<ConsentRecord>,
    events: Vec<RespondentEvent>,
    requirements: HashMap<Uuid, SurveyDataRequirement>,
    participations: HashMap<Uuid, SurveyParticipation>,
    consent_seq: i64,
    event_seq: i64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a respondent row as-is, bypassing every engine rule.
    /// Only for seeding corrupted fixtures in tests.
    #[cfg(test)]
    pub(crate) async fn force_respondent(&self, respondent: Respondent) {
        self.state
            .lock()
            .await
            .respondents
            .insert(respondent.id, respondent);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

fn contains(ids: &[Uuid], id: &Uuid) -> bool {
    ids.iter().any(|candidate| candidate == id)
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert_user(&mut self, user: &User) -> StoreResult<()> {
        let taken = self.working.users.values().any(|existing| {
            (user.email.is_some() && existing.email == user.email)
                || (user.username.is_some() && existing.username == user.username)
                || (user.telegram_chat_id.is_some()
                    && existing.telegram_chat_id == user.telegram_chat_id)
        });
        if taken || self.working.users.contains_key(&user.id) {
            return Err(EngineError::Conflict(
                "A user with the same identifier already exists".to_string(),
            ));
        }
        self.working.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&mut self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.working.users.get(&id).cloned())
    }

    async fn lock_user(&mut self, id: Uuid) -> StoreResult<Option<User>> {
        self.get_user(id).await
    }

    async fn insert_respondent(&mut self, respondent: &Respondent) -> StoreResult<()> {
        let taken = self
            .working
            .respondents
            .values()
            .any(|existing| existing.session_token == respondent.session_token);
        if taken {
            return Err(EngineError::Conflict(format!(
                "Session token '{}' is already in use",
                respondent.session_token
            )));
        }
        self.working
            .respondents
            .insert(respondent.id, respondent.clone());
        Ok(())
    }

    async fn get_respondent(&mut self, id: Uuid) -> StoreResult<Option<Respondent>> {
        Ok(self.working.respondents.get(&id).cloned())
    }

    async fn lock_respondent(&mut self, id: Uuid) -> StoreResult<Option<Respondent>> {
        self.get_respondent(id).await
    }

    async fn find_respondent_by_session(
        &mut self,
        session_token: &str,
    ) -> StoreResult<Option<Respondent>> {
        Ok(self
            .working
            .respondents
            .values()
            .find(|r| r.session_token == session_token)
            .cloned())
    }

    async fn find_respondents_by_fingerprint(
        &mut self,
        fingerprint: &str,
    ) -> StoreResult<Vec<Respondent>> {
        let mut matches: Vec<Respondent> = self
            .working
            .respondents
            .values()
            .filter(|r| r.fingerprint.as_deref() == Some(fingerprint) && !r.is_deleted)
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(matches)
    }

    async fn respondents_for_user(
        &mut self,
        user_id: Uuid,
        _lock: bool,
    ) -> StoreResult<Vec<Respondent>> {
        let mut linked: Vec<Respondent> = self
            .working
            .respondents
            .values()
            .filter(|r| r.user_id == Some(user_id) && !r.is_merged && !r.is_deleted)
            .cloned()
            .collect();
        linked.sort_by_key(|r| r.id);
        Ok(linked)
    }

    async fn merged_sources(&mut self, target: Uuid) -> StoreResult<Vec<Respondent>> {
        let mut sources: Vec<Respondent> = self
            .working
            .respondents
            .values()
            .filter(|r| r.merged_into_id == Some(target))
            .cloned()
            .collect();
        sources.sort_by_key(|r| r.id);
        Ok(sources)
    }

    async fn update_respondent(&mut self, respondent: &Respondent) -> StoreResult<()> {
        match self.working.respondents.get_mut(&respondent.id) {
            Some(existing) => {
                *existing = respondent.clone();
                Ok(())
            }
            None => Err(EngineError::respondent_not_found(respondent.id)),
        }
    }

    async fn append_consent(&mut self, record: NewConsentRecord) -> StoreResult<ConsentRecord> {
        self.working.consent_seq += 1;
        let record = record.sequenced(self.working.consent_seq);
        self.working.consents.push(record.clone());
        Ok(record)
    }

    async fn consent_records(
        &mut self,
        respondent_ids: &[Uuid],
        category: Option<&DataCategory>,
    ) -> StoreResult<Vec<ConsentRecord>> {
        let mut records: Vec<ConsentRecord> = self
            .working
            .consents
            .iter()
            .filter(|r| contains(respondent_ids, &r.respondent_id))
            .filter(|r| category.map_or(true, |c| &r.category == c))
            .cloned()
            .collect();
        records.sort_by_key(ConsentRecord::ordering_key);
        Ok(records)
    }

    async fn append_event(&mut self, event: NewRespondentEvent) -> StoreResult<RespondentEvent> {
        self.working.event_seq += 1;
        let event = event.sequenced(self.working.event_seq);
        self.working.events.push(event.clone());
        Ok(event)
    }

    async fn events(&mut self, respondent_ids: &[Uuid]) -> StoreResult<Vec<RespondentEvent>> {
        let mut events: Vec<RespondentEvent> = self
            .working
            .events
            .iter()
            .filter(|e| contains(respondent_ids, &e.respondent_id))
            .cloned()
            .collect();
        events.sort_by_key(RespondentEvent::ordering_key);
        Ok(events)
    }

    async fn upsert_requirements(
        &mut self,
        requirements: &SurveyDataRequirement,
    ) -> StoreResult<()> {
        self.working
            .requirements
            .insert(requirements.survey_id, requirements.clone());
        Ok(())
    }

    async fn get_requirements(
        &mut self,
        survey_id: Uuid,
    ) -> StoreResult<Option<SurveyDataRequirement>> {
        Ok(self.working.requirements.get(&survey_id).cloned())
    }

    async fn insert_participation(
        &mut self,
        participation: &SurveyParticipation,
    ) -> StoreResult<()> {
        let duplicate = self.working.participations.values().any(|p| {
            p.respondent_id == participation.respondent_id
                && p.survey_id == participation.survey_id
        });
        if duplicate {
            return Err(EngineError::Conflict(format!(
                "Respondent {} already participates in survey {}",
                participation.respondent_id, participation.survey_id
            )));
        }
        self.working
            .participations
            .insert(participation.id, participation.clone());
        Ok(())
    }

    async fn update_participation(
        &mut self,
        participation: &SurveyParticipation,
    ) -> StoreResult<()> {
        match self.working.participations.get_mut(&participation.id) {
            Some(existing) => {
                *existing = participation.clone();
                Ok(())
            }
            None => Err(EngineError::NotFound(format!(
                "Participation {} not found",
                participation.id
            ))),
        }
    }

    async fn participations(
        &mut self,
        respondent_ids: &[Uuid],
        survey_id: Option<Uuid>,
    ) -> StoreResult<Vec<SurveyParticipation>> {
        let mut found: Vec<SurveyParticipation> = self
            .working
            .participations
            .values()
            .filter(|p| contains(respondent_ids, &p.respondent_id))
            .filter(|p| survey_id.map_or(true, |s| p.survey_id == s))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(found)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::models::respondent::ExplicitAttributes;

    fn respondent(token: &str) -> Respondent {
        Respondent::anonymous(
            token.to_string(),
            None,
            ExplicitAttributes::default(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_discarded() {
        let store = MemoryStore::new();
        let r = respondent("sess-1");

        let mut tx = store.begin().await.unwrap();
        tx.insert_respondent(&r).await.unwrap();
        drop(tx);

        let mut tx = store.begin().await.unwrap();
        assert!(tx.get_respondent(r.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_committed_writes_are_visible() {
        let store = MemoryStore::new();
        let r = respondent("sess-1");

        let mut tx = store.begin().await.unwrap();
        tx.insert_respondent(&r).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let found = tx.find_respondent_by_session("sess-1").await.unwrap();
        assert_eq!(found.map(|f| f.id), Some(r.id));
    }

    #[tokio::test]
    async fn test_fingerprint_lookup_orders_by_activity_and_skips_deleted() {
        let store = MemoryStore::new();
        let mut older = respondent("fp-old");
        older.fingerprint = Some("fp-1".to_string());
        let mut newer = respondent("fp-new");
        newer.fingerprint = Some("fp-1".to_string());
        newer.last_activity_at = older.last_activity_at + chrono::Duration::seconds(5);
        let mut deleted = respondent("fp-gone");
        deleted.fingerprint = Some("fp-1".to_string());
        deleted.is_deleted = true;

        let mut tx = store.begin().await.unwrap();
        for r in [&older, &newer, &deleted] {
            tx.insert_respondent(r).await.unwrap();
        }
        let found = tx.find_respondents_by_fingerprint("fp-1").await.unwrap();
        let ids: Vec<Uuid> = found.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
        assert!(tx
            .find_respondents_by_fingerprint("fp-2")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_session_token_conflicts() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_respondent(&respondent("dup")).await.unwrap();
        let err = tx.insert_respondent(&respondent("dup")).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_consent_seq_is_monotonic() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut tx = store.begin().await.unwrap();
        let mut seqs = Vec::new();
        for granted in [true, false, true] {
            let rec = tx
                .append_consent(NewConsentRecord {
                    respondent_id: id,
                    survey_id: None,
                    category: DataCategory::Email,
                    granted,
                    recorded_at: now,
                    ip_address: None,
                    user_agent: None,
                    source: None,
                    schema_version: "1.0".to_string(),
                    details: None,
                })
                .await
                .unwrap();
            seqs.push(rec.seq);
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
