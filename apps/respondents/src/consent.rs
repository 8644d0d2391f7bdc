//! Consent Ledger: append-only opt-in decisions, read back latest-wins.

use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::engine::Shared;
use crate::errors::EngineError;
use crate::events::append_in;
use crate::identity::{merge_group_in, resolve_in};
use crate::models::consent::{ConsentRecord, ConsentState, DataCategory, NewConsentRecord};
use crate::models::context::RequestContext;
use crate::models::event::EventKind;

/// Latest-wins lookup over a set of records.
///
/// A survey-scoped query looks at records for exactly that survey first and
/// falls back to global (`survey_id = None`) records when there are none.
/// Among matches the greatest `(recorded_at, seq)` wins.
pub fn latest_state(
    records: &[ConsentRecord],
    category: &DataCategory,
    survey_id: Option<Uuid>,
) -> ConsentState {
    let latest_in = |scope: Option<Uuid>| {
        records
            .iter()
            .filter(|r| &r.category == category && r.survey_id == scope)
            .max_by_key(|r| r.ordering_key())
    };

    let found = match survey_id {
        Some(_) => latest_in(survey_id).or_else(|| latest_in(None)),
        None => latest_in(None),
    };
    found.map_or(ConsentState::Unknown, ConsentRecord::state)
}

/// Append-only consent ledger. Records are filed against the respondent id
/// given by the caller and read back across the whole merge group.
#[derive(Clone)]
pub struct ConsentLedger {
    shared: Shared,
}

impl ConsentLedger {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub async fn grant_consent(
        &self,
        respondent_id: Uuid,
        category: DataCategory,
        survey_id: Option<Uuid>,
        ctx: &RequestContext,
    ) -> Result<ConsentRecord, EngineError> {
        self.record_decision(respondent_id, category, survey_id, true, ctx)
            .await
    }

    pub async fn deny_consent(
        &self,
        respondent_id: Uuid,
        category: DataCategory,
        survey_id: Option<Uuid>,
        ctx: &RequestContext,
    ) -> Result<ConsentRecord, EngineError> {
        self.record_decision(respondent_id, category, survey_id, false, ctx)
            .await
    }

    async fn record_decision(
        &self,
        respondent_id: Uuid,
        category: DataCategory,
        survey_id: Option<Uuid>,
        granted: bool,
        ctx: &RequestContext,
    ) -> Result<ConsentRecord, EngineError> {
        let category = category.normalized()?;
        let now = self.shared.now();
        let mut tx = self.shared.store.begin().await?;
        // Only checks that the id leads somewhere; the record keeps the id as given.
        resolve_in(tx.as_mut(), respondent_id, self.shared.max_depth()).await?;

        let record = tx
            .append_consent(NewConsentRecord {
                respondent_id,
                survey_id,
                category: category.clone(),
                granted,
                recorded_at: now,
                ip_address: ctx.ip_address.clone(),
                user_agent: ctx.user_agent.clone(),
                source: ctx.source,
                schema_version: self.shared.config.consent_schema_version.clone(),
                details: None,
            })
            .await?;

        let kind = if granted {
            EventKind::ConsentGranted
        } else {
            EventKind::ConsentDenied
        };
        append_in(
            tx.as_mut(),
            respondent_id,
            kind,
            json!({
                "category": category,
                "survey_id": survey_id,
                "consent_record_id": record.id,
            }),
            ctx,
            now,
        )
        .await?;
        tx.commit().await?;

        info!(
            "Consent {} for {category} recorded for respondent {respondent_id} (seq {})",
            if granted { "granted" } else { "denied" },
            record.seq
        );
        Ok(record)
    }

    pub async fn current_consent(
        &self,
        respondent_id: Uuid,
        category: &DataCategory,
        survey_id: Option<Uuid>,
    ) -> Result<ConsentState, EngineError> {
        let category = category.clone().normalized()?;
        let max_depth = self.shared.max_depth();
        let mut tx = self.shared.store.begin().await?;
        let canonical = resolve_in(tx.as_mut(), respondent_id, max_depth).await?;
        let group = merge_group_in(tx.as_mut(), canonical.id, max_depth).await?;
        let records = tx.consent_records(&group, Some(&category)).await?;
        Ok(latest_state(&records, &category, survey_id))
    }

    /// Every record of the merge group, oldest first.
    pub async fn consent_history(
        &self,
        respondent_id: Uuid,
        category: Option<&DataCategory>,
    ) -> Result<Vec<ConsentRecord>, EngineError> {
        let category = category.cloned().map(DataCategory::normalized).transpose()?;
        let max_depth = self.shared.max_depth();
        let mut tx = self.shared.store.begin().await?;
        let canonical = resolve_in(tx.as_mut(), respondent_id, max_depth).await?;
        let group = merge_group_in(tx.as_mut(), canonical.id, max_depth).await?;
        tx.consent_records(&group, category.as_ref()).await
    }
}
