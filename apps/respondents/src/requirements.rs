//! Survey data policies and the gate that checks a respondent against them.

use std::collections::HashSet;

use tracing::{debug, info};
use uuid::Uuid;

use crate::consent::latest_state;
use crate::engine::Shared;
use crate::errors::EngineError;
use crate::identity::{merge_group_in, resolve_in};
use crate::models::consent::{ConsentState, DataCategory};
use crate::models::requirements::{Evaluation, SurveyDataRequirement};

/// Rejects declarations that could never be satisfied consistently.
pub fn validate_requirements(requirements: &SurveyDataRequirement) -> Result<(), EngineError> {
    let mut seen: HashSet<&DataCategory> = HashSet::new();
    for entry in &requirements.categories {
        if entry.mandatory && !entry.requested {
            return Err(EngineError::Validation(format!(
                "Category {} cannot be mandatory without being requested",
                entry.category
            )));
        }
        if let DataCategory::Custom(name) = &entry.category {
            if name.trim().is_empty() {
                return Err(EngineError::Validation(
                    "Custom data category name must not be empty".to_string(),
                ));
            }
        }
        if !seen.insert(&entry.category) {
            return Err(EngineError::Validation(format!(
                "Category {} is declared more than once",
                entry.category
            )));
        }
    }
    if requirements.data_retention_days <= 0 {
        return Err(EngineError::Validation(format!(
            "Data retention must be at least one day, got {}",
            requirements.data_retention_days
        )));
    }
    Ok(())
}

/// Sorts each requested category of `requirements` by the consent state
/// `state_of` reports for it.
pub fn classify(
    requirements: &SurveyDataRequirement,
    state_of: impl Fn(&DataCategory) -> ConsentState,
) -> Evaluation {
    let mut evaluation = Evaluation::unrestricted();
    for entry in requirements.requested() {
        let category = entry.category.clone();
        if state_of(&entry.category) == ConsentState::Granted {
            evaluation.satisfied.push(category);
        } else if entry.mandatory {
            evaluation.missing_required.push(category);
        } else {
            evaluation.missing_optional.push(category);
        }
    }
    evaluation.can_proceed = evaluation.missing_required.is_empty();
    evaluation
}

#[derive(Clone)]
pub struct RequirementEvaluator {
    shared: Shared,
}

impl RequirementEvaluator {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    /// Validates and stores the survey's policy, replacing any previous one.
    pub async fn declare_requirements(
        &self,
        mut requirements: SurveyDataRequirement,
    ) -> Result<SurveyDataRequirement, EngineError> {
        for entry in &mut requirements.categories {
            if let DataCategory::Custom(name) = &entry.category {
                entry.category = DataCategory::custom(name)?;
            }
        }
        validate_requirements(&requirements)?;
        requirements.updated_at = self.shared.now();

        let mut tx = self.shared.store.begin().await?;
        tx.upsert_requirements(&requirements).await?;
        tx.commit().await?;

        info!(
            "Declared data requirements for survey {} ({} categories)",
            requirements.survey_id,
            requirements.categories.len()
        );
        Ok(requirements)
    }

    pub async fn requirements_for(
        &self,
        survey_id: Uuid,
    ) -> Result<Option<SurveyDataRequirement>, EngineError> {
        let mut tx = self.shared.store.begin().await?;
        tx.get_requirements(survey_id).await
    }

    /// Read-only gate consulted before each survey step.
    pub async fn evaluate(
        &self,
        respondent_id: Uuid,
        survey_id: Uuid,
    ) -> Result<Evaluation, EngineError> {
        let max_depth = self.shared.max_depth();
        let mut tx = self.shared.store.begin().await?;
        let canonical = resolve_in(tx.as_mut(), respondent_id, max_depth).await?;

        let Some(requirements) = tx.get_requirements(survey_id).await? else {
            debug!("Survey {survey_id} declares no data requirements");
            return Ok(Evaluation::unrestricted());
        };

        let group = merge_group_in(tx.as_mut(), canonical.id, max_depth).await?;
        let records = tx.consent_records(&group, None).await?;
        let evaluation = classify(&requirements, |category| {
            latest_state(&records, category, Some(survey_id))
        });

        debug!(
            "Evaluated respondent {} for survey {survey_id}: can_proceed={} missing_required={:?}",
            canonical.id, evaluation.can_proceed, evaluation.missing_required
        );
        Ok(evaluation)
    }
}
