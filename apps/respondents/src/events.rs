//! Event Journal: append-only record of what happened to each respondent.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::engine::Shared;
use crate::errors::EngineError;
use crate::identity;
use crate::models::context::RequestContext;
use crate::models::event::{EventKind, NewRespondentEvent, RespondentEvent};
use crate::store::StoreTx;

/// Appends one event inside an open transaction.
pub(crate) async fn append_in(
    tx: &mut dyn StoreTx,
    respondent_id: Uuid,
    kind: EventKind,
    payload: Value,
    ctx: &RequestContext,
    at: DateTime<Utc>,
) -> Result<RespondentEvent, EngineError> {
    let event = tx
        .append_event(NewRespondentEvent {
            respondent_id,
            kind,
            payload,
            occurred_at: at,
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            source: ctx.source,
        })
        .await?;
    debug!("Appended {} event #{} for respondent {respondent_id}", kind, event.seq);
    Ok(event)
}

/// Append-only journal of identity, consent and survey-progress events.
#[derive(Clone)]
pub struct EventLog {
    shared: Shared,
}

impl EventLog {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub async fn append(
        &self,
        respondent_id: Uuid,
        kind: EventKind,
        payload: Value,
        ctx: &RequestContext,
    ) -> Result<RespondentEvent, EngineError> {
        let mut tx = self.shared.store.begin().await?;
        if tx.get_respondent(respondent_id).await?.is_none() {
            return Err(EngineError::respondent_not_found(respondent_id));
        }
        let event = append_in(
            tx.as_mut(),
            respondent_id,
            kind,
            payload,
            ctx,
            self.shared.now(),
        )
        .await?;
        tx.commit().await?;
        Ok(event)
    }

    /// Every event filed against the respondent's merge group, oldest first.
    pub async fn history(&self, respondent_id: Uuid) -> Result<Vec<RespondentEvent>, EngineError> {
        let mut tx = self.shared.store.begin().await?;
        let canonical =
            identity::resolve_in(tx.as_mut(), respondent_id, self.shared.max_depth()).await?;
        let group =
            identity::merge_group_in(tx.as_mut(), canonical.id, self.shared.max_depth()).await?;
        tx.events(&group).await
    }

    pub async fn history_of_kind(
        &self,
        respondent_id: Uuid,
        kind: EventKind,
    ) -> Result<Vec<RespondentEvent>, EngineError> {
        let mut events = self.history(respondent_id).await?;
        events.retain(|e| e.kind == kind);
        Ok(events)
    }
}
