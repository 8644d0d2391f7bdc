//! Data-access export of everything stored for one merge group.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::engine::Shared;
use crate::errors::EngineError;
use crate::identity::{merge_group_in, resolve_in};
use crate::models::consent::ConsentRecord;
use crate::models::event::RespondentEvent;
use crate::models::participation::SurveyParticipation;
use crate::models::respondent::Respondent;

/// Everything stored about one person, for a data-access request.
#[derive(Debug, Clone, Serialize)]
pub struct RespondentExport {
    pub exported_at: DateTime<Utc>,
    pub respondent: Respondent,
    /// Respondents merged into `respondent`, in merge-group order.
    pub absorbed: Vec<Respondent>,
    pub consents: Vec<ConsentRecord>,
    pub events: Vec<RespondentEvent>,
    pub participations: Vec<SurveyParticipation>,
}

#[derive(Clone)]
pub struct DataExporter {
    shared: Shared,
}

impl DataExporter {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub async fn export(&self, respondent_id: Uuid) -> Result<RespondentExport, EngineError> {
        let max_depth = self.shared.max_depth();
        let mut tx = self.shared.store.begin().await?;
        let respondent = resolve_in(tx.as_mut(), respondent_id, max_depth).await?;
        let group = merge_group_in(tx.as_mut(), respondent.id, max_depth).await?;

        let mut absorbed = Vec::with_capacity(group.len().saturating_sub(1));
        for id in group.iter().skip(1) {
            if let Some(member) = tx.get_respondent(*id).await? {
                absorbed.push(member);
            }
        }

        let export = RespondentExport {
            exported_at: self.shared.now(),
            consents: tx.consent_records(&group, None).await?,
            events: tx.events(&group).await?,
            participations: tx.participations(&group, None).await?,
            respondent,
            absorbed,
        };
        info!(
            "Exported data of respondent {} ({} consent records, {} events)",
            export.respondent.id,
            export.consents.len(),
            export.events.len()
        );
        Ok(export)
    }
}
