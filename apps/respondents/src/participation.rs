//! Survey participation lifecycle for each respondent.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::Shared;
use crate::errors::EngineError;
use crate::events::append_in;
use crate::identity::{merge_group_in, require_live, resolve_in, resolve_locked_in};
use crate::models::context::RequestContext;
use crate::models::event::EventKind;
use crate::models::participation::{progress_percentage, ParticipationStatus, SurveyParticipation};
use crate::models::respondent::Respondent;
use crate::store::StoreTx;

/// Tracks each respondent's progress through a survey. Abandonment is only
/// ever recorded on request; nothing here times a participation out.
#[derive(Clone)]
pub struct ParticipationTracker {
    shared: Shared,
}

impl ParticipationTracker {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    /// Starts the survey, or returns the participation already in flight for
    /// any respondent of the merge group.
    pub async fn start(
        &self,
        respondent_id: Uuid,
        survey_id: Uuid,
        total_questions: u32,
        ctx: &RequestContext,
    ) -> Result<SurveyParticipation, EngineError> {
        if total_questions == 0 {
            return Err(EngineError::Validation(
                "A survey needs at least one question".to_string(),
            ));
        }
        let now = self.shared.now();
        let max_depth = self.shared.max_depth();
        let mut tx = self.shared.store.begin().await?;
        let mut canonical = resolve_locked_in(tx.as_mut(), respondent_id, max_depth).await?;
        require_live(&canonical)?;

        let group = merge_group_in(tx.as_mut(), canonical.id, max_depth).await?;
        let existing = tx.participations(&group, Some(survey_id)).await?;
        if existing.iter().any(|p| p.status == ParticipationStatus::Completed) {
            return Err(EngineError::Conflict(format!(
                "Survey {survey_id} was already completed by respondent {}",
                canonical.id
            )));
        }
        if let Some(active) = existing.iter().find(|p| !p.status.is_final()) {
            debug!("Resuming participation {} in survey {survey_id}", active.id);
            return Ok(active.clone());
        }
        if !existing.is_empty() {
            return Err(EngineError::Conflict(format!(
                "Survey {survey_id} was abandoned by respondent {} and cannot be restarted",
                canonical.id
            )));
        }

        let participation = SurveyParticipation {
            id: Uuid::new_v4(),
            respondent_id: canonical.id,
            survey_id,
            status: ParticipationStatus::Started,
            answered_count: 0,
            total_questions,
            progress_percentage: 0.0,
            started_at: now,
            last_activity_at: now,
            completed_at: None,
            abandoned_at: None,
            time_spent_seconds: 0,
            completion_source: None,
        };
        tx.insert_participation(&participation).await?;
        touch_in(tx.as_mut(), &mut canonical, now).await?;
        append_in(
            tx.as_mut(),
            canonical.id,
            EventKind::SurveyStarted,
            json!({ "survey_id": survey_id, "total_questions": total_questions }),
            ctx,
            now,
        )
        .await?;
        tx.commit().await?;

        info!("Respondent {} started survey {survey_id}", canonical.id);
        Ok(participation)
    }

    /// Moves the answered count forward. The count never decreases.
    pub async fn record_progress(
        &self,
        respondent_id: Uuid,
        survey_id: Uuid,
        answered_count: u32,
        time_spent_delta_secs: u32,
        ctx: &RequestContext,
    ) -> Result<SurveyParticipation, EngineError> {
        let now = self.shared.now();
        let mut tx = self.shared.store.begin().await?;
        let (mut canonical, mut participation) =
            self.active_in(tx.as_mut(), respondent_id, survey_id).await?;

        if answered_count < participation.answered_count {
            return Err(EngineError::Validation(format!(
                "Answered count cannot go back from {} to {answered_count}",
                participation.answered_count
            )));
        }
        if answered_count > participation.total_questions {
            return Err(EngineError::Validation(format!(
                "Answered count {answered_count} exceeds the {} questions of survey {survey_id}",
                participation.total_questions
            )));
        }

        let advanced = answered_count > participation.answered_count;
        participation.status = ParticipationStatus::InProgress;
        participation.answered_count = answered_count;
        participation.progress_percentage =
            progress_percentage(answered_count, participation.total_questions);
        participation.time_spent_seconds += u64::from(time_spent_delta_secs);
        participation.last_activity_at = now;
        tx.update_participation(&participation).await?;
        touch_in(tx.as_mut(), &mut canonical, now).await?;

        if advanced {
            append_in(
                tx.as_mut(),
                canonical.id,
                EventKind::SurveyProgressed,
                json!({
                    "survey_id": survey_id,
                    "answered_count": answered_count,
                    "total_questions": participation.total_questions,
                    "progress_percentage": participation.progress_percentage,
                }),
                ctx,
                now,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(participation)
    }

    pub async fn complete(
        &self,
        respondent_id: Uuid,
        survey_id: Uuid,
        ctx: &RequestContext,
    ) -> Result<SurveyParticipation, EngineError> {
        let now = self.shared.now();
        let mut tx = self.shared.store.begin().await?;
        let (mut canonical, mut participation) =
            self.active_in(tx.as_mut(), respondent_id, survey_id).await?;

        if participation.answered_count != participation.total_questions {
            return Err(EngineError::Validation(format!(
                "Survey {survey_id} has {} of {} questions answered",
                participation.answered_count, participation.total_questions
            )));
        }

        participation.status = ParticipationStatus::Completed;
        participation.progress_percentage = 100.0;
        participation.completed_at = Some(now);
        participation.last_activity_at = now;
        participation.completion_source = ctx.source;
        tx.update_participation(&participation).await?;
        touch_in(tx.as_mut(), &mut canonical, now).await?;
        append_in(
            tx.as_mut(),
            canonical.id,
            EventKind::SurveyCompleted,
            json!({
                "survey_id": survey_id,
                "answered_count": participation.answered_count,
                "time_spent_seconds": participation.time_spent_seconds,
            }),
            ctx,
            now,
        )
        .await?;
        tx.commit().await?;

        info!("Respondent {} completed survey {survey_id}", canonical.id);
        Ok(participation)
    }

    pub async fn abandon(
        &self,
        respondent_id: Uuid,
        survey_id: Uuid,
        ctx: &RequestContext,
    ) -> Result<SurveyParticipation, EngineError> {
        let now = self.shared.now();
        let mut tx = self.shared.store.begin().await?;
        let (canonical, mut participation) =
            self.active_in(tx.as_mut(), respondent_id, survey_id).await?;

        participation.status = ParticipationStatus::Abandoned;
        participation.abandoned_at = Some(now);
        tx.update_participation(&participation).await?;
        append_in(
            tx.as_mut(),
            canonical.id,
            EventKind::SurveyAbandoned,
            json!({
                "survey_id": survey_id,
                "answered_count": participation.answered_count,
            }),
            ctx,
            now,
        )
        .await?;
        tx.commit().await?;

        info!("Respondent {} abandoned survey {survey_id}", canonical.id);
        Ok(participation)
    }

    /// All participations of the merge group, most recent activity first.
    pub async fn participations(
        &self,
        respondent_id: Uuid,
    ) -> Result<Vec<SurveyParticipation>, EngineError> {
        let max_depth = self.shared.max_depth();
        let mut tx = self.shared.store.begin().await?;
        let canonical = resolve_in(tx.as_mut(), respondent_id, max_depth).await?;
        let group = merge_group_in(tx.as_mut(), canonical.id, max_depth).await?;
        tx.participations(&group, None).await
    }

    /// The canonical respondent and its unfinished participation in the survey.
    async fn active_in(
        &self,
        tx: &mut dyn StoreTx,
        respondent_id: Uuid,
        survey_id: Uuid,
    ) -> Result<(Respondent, SurveyParticipation), EngineError> {
        let max_depth = self.shared.max_depth();
        let canonical = resolve_locked_in(tx, respondent_id, max_depth).await?;
        require_live(&canonical)?;
        let group = merge_group_in(tx, canonical.id, max_depth).await?;
        let existing = tx.participations(&group, Some(survey_id)).await?;

        match existing.iter().find(|p| !p.status.is_final()) {
            Some(active) => Ok((canonical, active.clone())),
            None if existing.is_empty() => Err(EngineError::NotFound(format!(
                "Respondent {} has not started survey {survey_id}",
                canonical.id
            ))),
            None => Err(EngineError::Validation(format!(
                "Participation in survey {survey_id} is already finalized"
            ))),
        }
    }
}

async fn touch_in(
    tx: &mut dyn StoreTx,
    respondent: &mut Respondent,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    respondent.last_activity_at = respondent.last_activity_at.max(now);
    tx.update_respondent(respondent).await
}
