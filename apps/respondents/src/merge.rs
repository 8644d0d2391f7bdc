//! Merge Coordinator: collapses the respondents of one person into a single
//! canonical identity when they authenticate.
//!
//! A merge only redirects. Absorbed respondents get `is_merged` and a
//! `merged_into_id` pointing at the canonical respondent; consent records and
//! events keep their original `respondent_id` and are found again through the
//! merge group. Respondents that were already redirected to an absorbed one
//! are repointed to the new canonical so every redirect stays one hop long.
//!
//! The whole operation runs in one store transaction holding row locks on the
//! user and every candidate respondent. Lock order is user first, then
//! respondents.

use std::cmp::Reverse;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::Shared;
use crate::errors::EngineError;
use crate::events::append_in;
use crate::identity::{link_in, require_live, resolve_locked_in};
use crate::models::context::RequestContext;
use crate::models::event::EventKind;
use crate::models::respondent::Respondent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub canonical_id: Uuid,
    /// Respondents absorbed by this call, in ascending id order.
    pub merged_ids: Vec<Uuid>,
}

/// Most recent `last_activity_at` wins; ties go to the lowest id.
pub fn select_canonical(candidates: &[Respondent]) -> Option<&Respondent> {
    candidates
        .iter()
        .max_by_key(|r| (r.last_activity_at, Reverse(r.id)))
}

#[derive(Clone)]
pub struct MergeCoordinator {
    shared: Shared,
}

impl MergeCoordinator {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub async fn merge_on_authentication(
        &self,
        user_id: Uuid,
        incoming_respondent_id: Uuid,
        ctx: &RequestContext,
    ) -> Result<MergeOutcome, EngineError> {
        let now = self.shared.now();
        let max_depth = self.shared.max_depth();
        let mut tx = self.shared.store.begin().await?;

        let user = tx
            .lock_user(user_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("User {user_id} not found")))?;
        if !user.is_usable() {
            return Err(EngineError::Validation(format!(
                "User {user_id} is not active"
            )));
        }

        let incoming = resolve_locked_in(tx.as_mut(), incoming_respondent_id, max_depth).await?;
        require_live(&incoming)?;
        if let Some(linked_user_id) = incoming.user_id {
            if linked_user_id != user_id {
                return Err(EngineError::AlreadyLinked {
                    respondent_id: incoming.id,
                    linked_user_id,
                    requested_user_id: user_id,
                });
            }
        }

        let mut candidates = tx.respondents_for_user(user_id, true).await?;
        if !candidates.iter().any(|r| r.id == incoming.id) {
            candidates.push(incoming);
        }
        candidates.sort_by_key(|r| r.id);

        let Some(mut canonical) = select_canonical(&candidates).cloned() else {
            return Err(EngineError::Internal(anyhow::anyhow!(
                "merge for user {user_id} produced no candidates"
            )));
        };

        if candidates.len() == 1 {
            if link_in(tx.as_mut(), &mut canonical, user_id, ctx, now).await? {
                tx.commit().await?;
            }
            debug!("Nothing to merge for user {user_id}; canonical is {}", canonical.id);
            return Ok(MergeOutcome {
                canonical_id: canonical.id,
                merged_ids: Vec::new(),
            });
        }

        let mut merged_ids = Vec::with_capacity(candidates.len() - 1);
        let mut repointed_by_source = Vec::with_capacity(candidates.len() - 1);
        for mut absorbed in candidates.into_iter().filter(|r| r.id != canonical.id) {
            absorbed.is_merged = true;
            absorbed.merged_into_id = Some(canonical.id);
            tx.update_respondent(&absorbed).await?;

            let mut repointed = Vec::new();
            for mut source in tx.merged_sources(absorbed.id).await? {
                source.merged_into_id = Some(canonical.id);
                tx.update_respondent(&source).await?;
                repointed.push(source.id);
            }

            merged_ids.push(absorbed.id);
            repointed_by_source.push(repointed);
        }

        link_in(tx.as_mut(), &mut canonical, user_id, ctx, now).await?;

        for (absorbed_id, repointed) in merged_ids.iter().zip(&repointed_by_source) {
            append_in(
                tx.as_mut(),
                canonical.id,
                EventKind::Merged,
                json!({
                    "absorbed_respondent_id": absorbed_id,
                    "user_id": user_id,
                    "repointed": repointed,
                }),
                ctx,
                now,
            )
            .await?;
        }
        tx.commit().await?;

        info!(
            "Merged {} respondent(s) into {} for user {user_id}: {:?}",
            merged_ids.len(),
            canonical.id,
            merged_ids
        );
        Ok(MergeOutcome {
            canonical_id: canonical.id,
            merged_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::engine::test_support::{harness, Harness};
    use crate::models::consent::{ConsentState, DataCategory};
    use crate::models::respondent::ExplicitAttributes;
    use crate::models::user::{NewUser, User};

    fn ctx() -> RequestContext {
        RequestContext::default()
    }

    async fn user(h: &Harness, name: &str) -> User {
        h.engine
            .identity()
            .register_user(NewUser {
                username: Some(name.to_string()),
                ..NewUser::default()
            })
            .await
            .unwrap()
    }

    async fn anonymous(h: &Harness, token: &str) -> Respondent {
        h.engine
            .identity()
            .create_anonymous_respondent(token, None, ExplicitAttributes::default(), &ctx())
            .await
            .unwrap()
    }

    #[test]
    fn test_select_canonical_prefers_recent_then_lowest_id() {
        let now = chrono::Utc::now();
        let mut a = Respondent::anonymous("a".into(), None, ExplicitAttributes::default(), now);
        let mut b = Respondent::anonymous("b".into(), None, ExplicitAttributes::default(), now);
        a.id = Uuid::from_u128(2);
        b.id = Uuid::from_u128(1);
        let candidates = vec![a.clone(), b.clone()];
        assert_eq!(select_canonical(&candidates).map(|r| r.id), Some(b.id));

        a.last_activity_at = now + chrono::Duration::seconds(1);
        let candidates = vec![a.clone(), b];
        assert_eq!(select_canonical(&candidates).map(|r| r.id), Some(a.id));
        assert!(select_canonical(&[]).is_none());
    }

    #[tokio::test]
    async fn test_more_recent_respondent_becomes_canonical() {
        let h = harness();
        let u = user(&h, "u").await;
        let a1 = anonymous(&h, "a1").await;
        h.engine.identity().link_to_user(a1.id, u.id, &ctx()).await.unwrap();
        h.advance(60);
        let a2 = anonymous(&h, "a2").await;

        let outcome = h
            .engine
            .merge()
            .merge_on_authentication(u.id, a2.id, &ctx())
            .await
            .unwrap();
        assert_eq!(outcome.canonical_id, a2.id);
        assert_eq!(outcome.merged_ids, vec![a1.id]);

        let stored_a1 = h.engine.identity().get_respondent(a1.id).await.unwrap();
        assert!(stored_a1.is_merged);
        assert_eq!(stored_a1.merged_into_id, Some(a2.id));

        let stored_a2 = h.engine.identity().get_respondent(a2.id).await.unwrap();
        assert_eq!(stored_a2.user_id, Some(u.id));
        assert!(!stored_a2.is_anonymous);

        let merged = h
            .engine
            .events()
            .history_of_kind(a2.id, EventKind::Merged)
            .await
            .unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].respondent_id, a2.id);
        assert_eq!(
            merged[0].payload["absorbed_respondent_id"],
            json!(a1.id)
        );

        let linked = h.engine.identity().get_respondents_for_user(u.id).await.unwrap();
        assert_eq!(linked.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a2.id]);
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let h = harness();
        let u = user(&h, "u").await;
        let a1 = anonymous(&h, "a1").await;
        h.engine.identity().link_to_user(a1.id, u.id, &ctx()).await.unwrap();
        h.advance(5);
        let a2 = anonymous(&h, "a2").await;

        let first = h.engine.merge().merge_on_authentication(u.id, a2.id, &ctx()).await.unwrap();
        let second = h.engine.merge().merge_on_authentication(u.id, a2.id, &ctx()).await.unwrap();
        assert_eq!(first.canonical_id, second.canonical_id);
        assert!(second.merged_ids.is_empty());

        // The absorbed id resolves to the same canonical too.
        let third = h.engine.merge().merge_on_authentication(u.id, a1.id, &ctx()).await.unwrap();
        assert_eq!(third.canonical_id, first.canonical_id);
        assert!(third.merged_ids.is_empty());

        let merged = h
            .engine
            .events()
            .history_of_kind(a2.id, EventKind::Merged)
            .await
            .unwrap();
        assert_eq!(merged.len(), 1);
    }

    #[tokio::test]
    async fn test_single_candidate_just_links() {
        let h = harness();
        let u = user(&h, "solo").await;
        let r = anonymous(&h, "solo-sess").await;

        let outcome = h.engine.merge().merge_on_authentication(u.id, r.id, &ctx()).await.unwrap();
        assert_eq!(outcome.canonical_id, r.id);
        assert!(outcome.merged_ids.is_empty());
        let stored = h.engine.identity().get_respondent(r.id).await.unwrap();
        assert_eq!(stored.user_id, Some(u.id));
    }

    #[tokio::test]
    async fn test_conflicting_user_is_surfaced_without_changes() {
        let h = harness();
        let u1 = user(&h, "u1").await;
        let u2 = user(&h, "u2").await;
        let a = anonymous(&h, "claimed").await;
        h.engine.identity().link_to_user(a.id, u1.id, &ctx()).await.unwrap();
        let other = anonymous(&h, "u2-device").await;
        h.engine.identity().link_to_user(other.id, u2.id, &ctx()).await.unwrap();

        let before = h.engine.identity().get_respondent(a.id).await.unwrap();
        let events_before = h.engine.events().history(a.id).await.unwrap().len();

        let err = h
            .engine
            .merge()
            .merge_on_authentication(u2.id, a.id, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyLinked { linked_user_id, .. } if linked_user_id == u1.id));

        assert_eq!(h.engine.identity().get_respondent(a.id).await.unwrap(), before);
        assert_eq!(h.engine.events().history(a.id).await.unwrap().len(), events_before);
        let other_after = h.engine.identity().get_respondent(other.id).await.unwrap();
        assert!(!other_after.is_merged);
    }

    #[tokio::test]
    async fn test_equal_activity_picks_lowest_id() {
        let h = harness();
        let u = user(&h, "tie").await;
        let a1 = anonymous(&h, "tie-1").await;
        let a2 = anonymous(&h, "tie-2").await;
        h.engine.identity().link_to_user(a1.id, u.id, &ctx()).await.unwrap();

        let outcome = h.engine.merge().merge_on_authentication(u.id, a2.id, &ctx()).await.unwrap();
        assert_eq!(outcome.canonical_id, a1.id.min(a2.id));
        assert_eq!(outcome.merged_ids, vec![a1.id.max(a2.id)]);
    }

    #[tokio::test]
    async fn test_sources_of_absorbed_respondent_are_repointed() {
        let h = harness();
        let u = user(&h, "chain").await;
        let b = anonymous(&h, "b").await;
        h.engine.identity().link_to_user(b.id, u.id, &ctx()).await.unwrap();
        h.advance(10);
        let a1 = anonymous(&h, "a1").await;
        h.engine.merge().merge_on_authentication(u.id, a1.id, &ctx()).await.unwrap();
        h.advance(10);
        let a2 = anonymous(&h, "a2").await;

        let outcome = h.engine.merge().merge_on_authentication(u.id, a2.id, &ctx()).await.unwrap();
        assert_eq!(outcome.canonical_id, a2.id);
        assert_eq!(outcome.merged_ids, vec![a1.id]);

        let stored_b = h.engine.identity().get_respondent(b.id).await.unwrap();
        assert_eq!(stored_b.merged_into_id, Some(a2.id));
        assert_eq!(h.engine.identity().resolve_respondent(b.id).await.unwrap().id, a2.id);

        let merged = h
            .engine
            .events()
            .history_of_kind(a2.id, EventKind::Merged)
            .await
            .unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].payload["repointed"], json!([b.id]));
    }

    #[tokio::test]
    async fn test_consent_of_absorbed_respondent_is_visible_after_merge() {
        let h = harness();
        let u = user(&h, "consent").await;
        let a1 = anonymous(&h, "c-a1").await;
        h.engine
            .consent()
            .grant_consent(a1.id, DataCategory::Email, None, &ctx())
            .await
            .unwrap();
        h.engine.identity().link_to_user(a1.id, u.id, &ctx()).await.unwrap();
        h.advance(30);
        let a2 = anonymous(&h, "c-a2").await;
        h.engine.merge().merge_on_authentication(u.id, a2.id, &ctx()).await.unwrap();

        let state = h
            .engine
            .consent()
            .current_consent(a2.id, &DataCategory::Email, None)
            .await
            .unwrap();
        assert_eq!(state, ConsentState::Granted);

        // The record still belongs to the respondent it was filed against.
        let history = h.engine.consent().consent_history(a2.id, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].respondent_id, a1.id);
    }

    #[tokio::test]
    async fn test_cycle_in_incoming_chain_aborts_merge() {
        let h = harness();
        let u = user(&h, "cyc").await;
        let now = h.clock.now();
        let mut a = Respondent::anonymous("cyc-a".into(), None, ExplicitAttributes::default(), now);
        let mut b = Respondent::anonymous("cyc-b".into(), None, ExplicitAttributes::default(), now);
        a.is_merged = true;
        a.merged_into_id = Some(b.id);
        b.is_merged = true;
        b.merged_into_id = Some(a.id);
        h.store.force_respondent(a.clone()).await;
        h.store.force_respondent(b.clone()).await;

        let err = h
            .engine
            .merge()
            .merge_on_authentication(u.id, a.id, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity { .. }));
        assert!(h.engine.identity().get_respondents_for_user(u.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_authentications_merge_once() {
        let h = harness();
        let u = user(&h, "race").await;
        let a1 = anonymous(&h, "race-1").await;
        h.engine.identity().link_to_user(a1.id, u.id, &ctx()).await.unwrap();
        h.advance(1);
        let a2 = anonymous(&h, "race-2").await;

        let merge = h.engine.merge();
        let request = ctx();
        let (first, second) = tokio::join!(
            merge.merge_on_authentication(u.id, a2.id, &request),
            merge.merge_on_authentication(u.id, a2.id, &request),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.canonical_id, second.canonical_id);
        assert_eq!(first.merged_ids.len() + second.merged_ids.len(), 1);

        let merged = h
            .engine
            .events()
            .history_of_kind(a2.id, EventKind::Merged)
            .await
            .unwrap();
        assert_eq!(merged.len(), 1);
    }

    mod failing {
        use std::sync::Arc;

        use async_trait::async_trait;
        use uuid::Uuid;

        use crate::errors::EngineError;
        use crate::models::consent::{ConsentRecord, DataCategory, NewConsentRecord};
        use crate::models::event::{EventKind, NewRespondentEvent, RespondentEvent};
        use crate::models::participation::SurveyParticipation;
        use crate::models::requirements::SurveyDataRequirement;
        use crate::models::respondent::Respondent;
        use crate::models::user::User;
        use crate::store::{MemoryStore, Store, StoreResult, StoreTx};

        #[derive(Debug, Clone, Copy)]
        pub enum FailPoint {
            /// The second `update_respondent` of a transaction.
            SecondUpdate,
            /// The first `merged` event appended.
            MergedEvent,
        }

        /// Memory store whose transactions break at a chosen write.
        pub struct FailingStore {
            pub inner: MemoryStore,
            pub fail_at: FailPoint,
        }

        struct FailingTx {
            inner: Box<dyn StoreTx>,
            fail_at: FailPoint,
            updates: usize,
        }

        fn injected() -> EngineError {
            EngineError::Internal(anyhow::anyhow!("injected store failure"))
        }

        #[async_trait]
        impl Store for FailingStore {
            async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
                Ok(Box::new(FailingTx {
                    inner: self.inner.begin().await?,
                    fail_at: self.fail_at,
                    updates: 0,
                }))
            }

            async fn ping(&self) -> StoreResult<()> {
                Ok(())
            }

            fn backend_name(&self) -> &'static str {
                "failing"
            }
        }

        #[async_trait]
        impl StoreTx for FailingTx {
            async fn insert_user(&mut self, user: &User) -> StoreResult<()> {
                self.inner.insert_user(user).await
            }

            async fn get_user(&mut self, id: Uuid) -> StoreResult<Option<User>> {
                self.inner.get_user(id).await
            }

            async fn lock_user(&mut self, id: Uuid) -> StoreResult<Option<User>> {
                self.inner.lock_user(id).await
            }

            async fn insert_respondent(&mut self, respondent: &Respondent) -> StoreResult<()> {
                self.inner.insert_respondent(respondent).await
            }

            async fn get_respondent(&mut self, id: Uuid) -> StoreResult<Option<Respondent>> {
                self.inner.get_respondent(id).await
            }

            async fn lock_respondent(&mut self, id: Uuid) -> StoreResult<Option<Respondent>> {
                self.inner.lock_respondent(id).await
            }

            async fn find_respondent_by_session(
                &mut self,
                session_token: &str,
            ) -> StoreResult<Option<Respondent>> {
                self.inner.find_respondent_by_session(session_token).await
            }

            async fn find_respondents_by_fingerprint(
                &mut self,
                fingerprint: &str,
            ) -> StoreResult<Vec<Respondent>> {
                self.inner.find_respondents_by_fingerprint(fingerprint).await
            }

            async fn respondents_for_user(
                &mut self,
                user_id: Uuid,
                lock: bool,
            ) -> StoreResult<Vec<Respondent>> {
                self.inner.respondents_for_user(user_id, lock).await
            }

            async fn merged_sources(&mut self, target: Uuid) -> StoreResult<Vec<Respondent>> {
                self.inner.merged_sources(target).await
            }

            async fn update_respondent(&mut self, respondent: &Respondent) -> StoreResult<()> {
                self.updates += 1;
                if matches!(self.fail_at, FailPoint::SecondUpdate) && self.updates == 2 {
                    return Err(injected());
                }
                self.inner.update_respondent(respondent).await
            }

            async fn append_consent(
                &mut self,
                record: NewConsentRecord,
            ) -> StoreResult<ConsentRecord> {
                self.inner.append_consent(record).await
            }

            async fn consent_records(
                &mut self,
                respondent_ids: &[Uuid],
                category: Option<&DataCategory>,
            ) -> StoreResult<Vec<ConsentRecord>> {
                self.inner.consent_records(respondent_ids, category).await
            }

            async fn append_event(
                &mut self,
                event: NewRespondentEvent,
            ) -> StoreResult<RespondentEvent> {
                if matches!(self.fail_at, FailPoint::MergedEvent) && event.kind == EventKind::Merged {
                    return Err(injected());
                }
                self.inner.append_event(event).await
            }

            async fn events(&mut self, respondent_ids: &[Uuid]) -> StoreResult<Vec<RespondentEvent>> {
                self.inner.events(respondent_ids).await
            }

            async fn upsert_requirements(
                &mut self,
                requirements: &SurveyDataRequirement,
            ) -> StoreResult<()> {
                self.inner.upsert_requirements(requirements).await
            }

            async fn get_requirements(
                &mut self,
                survey_id: Uuid,
            ) -> StoreResult<Option<SurveyDataRequirement>> {
                self.inner.get_requirements(survey_id).await
            }

            async fn insert_participation(
                &mut self,
                participation: &SurveyParticipation,
            ) -> StoreResult<()> {
                self.inner.insert_participation(participation).await
            }

            async fn update_participation(
                &mut self,
                participation: &SurveyParticipation,
            ) -> StoreResult<()> {
                self.inner.update_participation(participation).await
            }

            async fn participations(
                &mut self,
                respondent_ids: &[Uuid],
                survey_id: Option<Uuid>,
            ) -> StoreResult<Vec<SurveyParticipation>> {
                self.inner.participations(respondent_ids, survey_id).await
            }

            async fn commit(self: Box<Self>) -> StoreResult<()> {
                self.inner.commit().await
            }
        }

        pub fn failing_store(inner: &MemoryStore, fail_at: FailPoint) -> Arc<dyn Store> {
            Arc::new(FailingStore {
                inner: inner.clone(),
                fail_at,
            })
        }
    }

    /// Two linked respondents plus a newer incoming one, so a merge absorbs two.
    async fn three_candidates(h: &Harness, name: &str) -> (User, Vec<Respondent>) {
        let u = user(h, name).await;
        let mut all = Vec::new();
        for i in 0..3 {
            let r = anonymous(h, &format!("{name}-{i}")).await;
            if i < 2 {
                h.engine.identity().link_to_user(r.id, u.id, &ctx()).await.unwrap();
            }
            all.push(r);
            h.advance(10);
        }
        (u, all)
    }

    async fn assert_nothing_merged(h: &Harness, u: &User, respondents: &[Respondent]) {
        for r in respondents {
            let stored = h.engine.identity().get_respondent(r.id).await.unwrap();
            assert!(!stored.is_merged, "{} was left merged", r.id);
            assert_eq!(stored.merged_into_id, None);
            let merged = h
                .engine
                .events()
                .history_of_kind(r.id, EventKind::Merged)
                .await
                .unwrap();
            assert!(merged.is_empty());
        }
        let incoming = h.engine.identity().get_respondent(respondents[2].id).await.unwrap();
        assert_eq!(incoming.user_id, None);
        assert!(incoming.is_anonymous);
        let linked = h.engine.identity().get_respondents_for_user(u.id).await.unwrap();
        assert_eq!(linked.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_midway_through_absorbing_persists_nothing() {
        let h = harness();
        let (u, respondents) = three_candidates(&h, "midway").await;
        let engine = crate::engine::Engine::new(
            failing::failing_store(&h.store, failing::FailPoint::SecondUpdate),
            crate::config::EngineConfig::default(),
            h.clock.clone(),
        );

        let err = engine
            .merge()
            .merge_on_authentication(u.id, respondents[2].id, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
        assert_nothing_merged(&h, &u, &respondents).await;

        // The store is still usable and the merge goes through afterwards.
        let outcome = h
            .engine
            .merge()
            .merge_on_authentication(u.id, respondents[2].id, &ctx())
            .await
            .unwrap();
        assert_eq!(outcome.canonical_id, respondents[2].id);
        assert_eq!(outcome.merged_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_on_merged_event_persists_nothing() {
        let h = harness();
        let (u, respondents) = three_candidates(&h, "journal").await;
        let engine = crate::engine::Engine::new(
            failing::failing_store(&h.store, failing::FailPoint::MergedEvent),
            crate::config::EngineConfig::default(),
            h.clock.clone(),
        );

        let err = engine
            .merge()
            .merge_on_authentication(u.id, respondents[2].id, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
        assert_nothing_merged(&h, &u, &respondents).await;
        let authorized = h
            .engine
            .events()
            .history_of_kind(respondents[2].id, EventKind::Authorized)
            .await
            .unwrap();
        assert!(authorized.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let h = harness();
        let r = anonymous(&h, "nouser").await;
        let err = h
            .engine
            .merge()
            .merge_on_authentication(Uuid::new_v4(), r.id, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
