//! Identity Store: users, respondents, and resolution of merge redirects.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::consent::latest_state;
use crate::engine::Shared;
use crate::errors::EngineError;
use crate::events::append_in;
use crate::models::consent::{ConsentState, DataCategory};
use crate::models::context::RequestContext;
use crate::models::event::EventKind;
use crate::models::respondent::{
    ExplicitAttributes, PermissionedAttributes, PreciseLocation, Respondent,
};
use crate::models::user::{NewUser, User};
use crate::store::StoreTx;

const MAX_SESSION_TOKEN_LEN: usize = 255;

// ────────────────────────────────────────────────────────────────────────────
// Transaction-level helpers shared with the other components
// ────────────────────────────────────────────────────────────────────────────

/// Follows `merged_into_id` until a non-merged respondent is reached.
/// Fails with `DataIntegrity` on a cycle, a dangling target, or more than
/// `max_depth` hops.
pub(crate) async fn resolve_in(
    tx: &mut dyn StoreTx,
    id: Uuid,
    max_depth: usize,
) -> Result<Respondent, EngineError> {
    let mut chain = vec![id];
    let mut current = tx
        .get_respondent(id)
        .await?
        .ok_or_else(|| EngineError::respondent_not_found(id))?;

    while current.is_merged {
        let Some(next) = current.merged_into_id else {
            return Err(EngineError::integrity(
                format!("respondent {} is merged but has no merge target", current.id),
                chain,
            ));
        };
        if chain.contains(&next) {
            chain.push(next);
            return Err(EngineError::integrity("merge chain contains a cycle", chain));
        }
        if chain.len() > max_depth {
            chain.push(next);
            return Err(EngineError::integrity(
                format!("merge chain exceeds the maximum depth of {max_depth}"),
                chain,
            ));
        }
        chain.push(next);
        current = match tx.get_respondent(next).await? {
            Some(r) => r,
            None => {
                return Err(EngineError::integrity(
                    format!("merge target {next} does not exist"),
                    chain,
                ))
            }
        };
    }

    Ok(current)
}

/// The canonical id followed by every respondent that resolves to it.
pub(crate) async fn merge_group_in(
    tx: &mut dyn StoreTx,
    canonical_id: Uuid,
    max_depth: usize,
) -> Result<Vec<Uuid>, EngineError> {
    let mut group = vec![canonical_id];
    let mut seen: HashSet<Uuid> = HashSet::from([canonical_id]);
    let mut frontier = vec![canonical_id];
    let mut depth = 0;

    while !frontier.is_empty() {
        let mut next = Vec::new();
        for target in frontier {
            for source in tx.merged_sources(target).await? {
                if !seen.insert(source.id) {
                    return Err(EngineError::integrity(
                        "merge graph contains a cycle",
                        vec![canonical_id, target, source.id],
                    ));
                }
                group.push(source.id);
                next.push(source.id);
            }
        }
        if !next.is_empty() {
            depth += 1;
            if depth > max_depth {
                return Err(EngineError::integrity(
                    format!("merge tree under {canonical_id} exceeds the maximum depth of {max_depth}"),
                    group,
                ));
            }
        }
        frontier = next;
    }

    Ok(group)
}

/// Resolves and then locks the canonical respondent, re-resolving if a
/// concurrent merge redirected it between the read and the lock.
pub(crate) async fn resolve_locked_in(
    tx: &mut dyn StoreTx,
    id: Uuid,
    max_depth: usize,
) -> Result<Respondent, EngineError> {
    let mut start = id;
    for _ in 0..=max_depth {
        let resolved = resolve_in(tx, start, max_depth).await?;
        let locked = tx
            .lock_respondent(resolved.id)
            .await?
            .ok_or_else(|| EngineError::respondent_not_found(resolved.id))?;
        if locked.is_canonical() {
            return Ok(locked);
        }
        warn!("Respondent {} was merged concurrently, re-resolving", locked.id);
        start = locked.id;
    }
    Err(EngineError::integrity(
        "respondent kept moving while being locked",
        vec![id],
    ))
}

pub(crate) fn require_live(respondent: &Respondent) -> Result<(), EngineError> {
    if respondent.is_deleted {
        return Err(EngineError::NotFound(format!(
            "Respondent {} has been deleted",
            respondent.id
        )));
    }
    Ok(())
}

/// Links `respondent` to `user_id`. Returns `true` if the link is new.
/// Fails with `ConsentRequired` unless `category` is granted for the merge
/// group of `canonical_id` in the given scope.
async fn require_consent_in(
    tx: &mut dyn StoreTx,
    canonical_id: Uuid,
    category: DataCategory,
    survey_id: Option<Uuid>,
    max_depth: usize,
) -> Result<(), EngineError> {
    let group = merge_group_in(tx, canonical_id, max_depth).await?;
    let records = tx.consent_records(&group, Some(&category)).await?;
    if latest_state(&records, &category, survey_id) != ConsentState::Granted {
        return Err(EngineError::ConsentRequired { category });
    }
    Ok(())
}

pub(crate) async fn link_in(
    tx: &mut dyn StoreTx,
    respondent: &mut Respondent,
    user_id: Uuid,
    ctx: &RequestContext,
    now: DateTime<Utc>,
) -> Result<bool, EngineError> {
    match respondent.user_id {
        Some(existing) if existing != user_id => Err(EngineError::AlreadyLinked {
            respondent_id: respondent.id,
            linked_user_id: existing,
            requested_user_id: user_id,
        }),
        Some(_) => Ok(false),
        None => {
            let was_anonymous = respondent.is_anonymous;
            respondent.user_id = Some(user_id);
            respondent.is_anonymous = false;
            respondent.last_activity_at = respondent.last_activity_at.max(now);
            tx.update_respondent(respondent).await?;
            append_in(
                tx,
                respondent.id,
                EventKind::Authorized,
                json!({ "user_id": user_id, "was_anonymous": was_anonymous }),
                ctx,
                now,
            )
            .await?;
            info!("Linked respondent {} to user {user_id}", respondent.id);
            Ok(true)
        }
    }
}

/// Canonical respondent of the first live fingerprint match.
async fn fingerprint_match_in(
    tx: &mut dyn StoreTx,
    fingerprint: &str,
    max_depth: usize,
) -> Result<Option<Respondent>, EngineError> {
    if fingerprint.trim().is_empty() {
        return Ok(None);
    }
    for candidate in tx.find_respondents_by_fingerprint(fingerprint).await? {
        let canonical = resolve_in(tx, candidate.id, max_depth).await?;
        if !canonical.is_deleted {
            return Ok(Some(canonical));
        }
    }
    Ok(None)
}

// ────────────────────────────────────────────────────────────────────────────
// Validation
// ────────────────────────────────────────────────────────────────────────────

fn validate_session_token(token: &str) -> Result<(), EngineError> {
    if token.trim().is_empty() {
        return Err(EngineError::Validation(
            "Session token must not be empty".to_string(),
        ));
    }
    if token.len() > MAX_SESSION_TOKEN_LEN {
        return Err(EngineError::Validation(format!(
            "Session token exceeds {MAX_SESSION_TOKEN_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_new_user(new_user: &NewUser) -> Result<(), EngineError> {
    let has_email = new_user.email.as_deref().is_some_and(|e| !e.trim().is_empty());
    let has_username = new_user
        .username
        .as_deref()
        .is_some_and(|u| !u.trim().is_empty());
    if !has_email && !has_username && new_user.telegram_chat_id.is_none() {
        return Err(EngineError::Validation(
            "A user needs at least one of email, username or chat id".to_string(),
        ));
    }
    if let Some(email) = new_user.email.as_deref() {
        let valid = email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty());
        if !valid {
            return Err(EngineError::Validation(format!(
                "'{email}' is not a valid email address"
            )));
        }
    }
    Ok(())
}

fn validate_location(location: &PreciseLocation) -> Result<(), EngineError> {
    if !(-90.0..=90.0).contains(&location.latitude) {
        return Err(EngineError::Validation(format!(
            "Latitude {} is outside [-90, 90]",
            location.latitude
        )));
    }
    if !(-180.0..=180.0).contains(&location.longitude) {
        return Err(EngineError::Validation(format!(
            "Longitude {} is outside [-180, 180]",
            location.longitude
        )));
    }
    if location.accuracy_m.is_some_and(|a| !(a >= 0.0)) {
        return Err(EngineError::Validation(
            "Location accuracy must be non-negative".to_string(),
        ));
    }
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// Public component
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct IdentityStore {
    shared: Shared,
}

impl IdentityStore {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub async fn register_user(&self, new_user: NewUser) -> Result<User, EngineError> {
        validate_new_user(&new_user)?;
        let user = User {
            id: Uuid::new_v4(),
            email: new_user.email.map(|e| e.trim().to_lowercase()),
            username: new_user.username.map(|u| u.trim().to_string()),
            telegram_chat_id: new_user.telegram_chat_id,
            is_active: true,
            is_deleted: false,
            created_at: self.shared.now(),
        };
        let mut tx = self.shared.store.begin().await?;
        tx.insert_user(&user).await?;
        tx.commit().await?;
        info!("Registered user {}", user.id);
        Ok(user)
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<User, EngineError> {
        let mut tx = self.shared.store.begin().await?;
        tx.get_user(user_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("User {user_id} not found")))
    }

    /// First contact from a visitor. Fails with `Conflict` if the session
    /// token is already known.
    pub async fn create_anonymous_respondent(
        &self,
        session_token: &str,
        fingerprint: Option<String>,
        explicit: ExplicitAttributes,
        ctx: &RequestContext,
    ) -> Result<Respondent, EngineError> {
        validate_session_token(session_token)?;
        let now = self.shared.now();
        let respondent =
            Respondent::anonymous(session_token.to_string(), fingerprint, explicit, now);

        let mut tx = self.shared.store.begin().await?;
        if tx.find_respondent_by_session(session_token).await?.is_some() {
            return Err(EngineError::Conflict(format!(
                "Session token '{session_token}' is already in use"
            )));
        }
        tx.insert_respondent(&respondent).await?;
        append_in(
            tx.as_mut(),
            respondent.id,
            EventKind::Created,
            json!({
                "entry_point": respondent.explicit.entry_point,
                "has_fingerprint": respondent.fingerprint.is_some(),
            }),
            ctx,
            now,
        )
        .await?;
        tx.commit().await?;

        info!("Created anonymous respondent {}", respondent.id);
        Ok(respondent)
    }

    /// The stored row, without following merge redirects.
    pub async fn get_respondent(&self, id: Uuid) -> Result<Respondent, EngineError> {
        let mut tx = self.shared.store.begin().await?;
        tx.get_respondent(id)
            .await?
            .ok_or_else(|| EngineError::respondent_not_found(id))
    }

    /// The canonical respondent behind `id`.
    pub async fn resolve_respondent(&self, id: Uuid) -> Result<Respondent, EngineError> {
        let mut tx = self.shared.store.begin().await?;
        resolve_in(tx.as_mut(), id, self.shared.max_depth()).await
    }

    /// Canonical respondent for a session token, if the token is known.
    pub async fn respondent_for_session(
        &self,
        session_token: &str,
    ) -> Result<Option<Respondent>, EngineError> {
        let mut tx = self.shared.store.begin().await?;
        match tx.find_respondent_by_session(session_token).await? {
            Some(r) => Ok(Some(
                resolve_in(tx.as_mut(), r.id, self.shared.max_depth()).await?,
            )),
            None => Ok(None),
        }
    }

    /// Canonical respondent of the most recently active live respondent
    /// carrying `fingerprint`, if any.
    pub async fn respondent_for_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<Respondent>, EngineError> {
        let mut tx = self.shared.store.begin().await?;
        fingerprint_match_in(tx.as_mut(), fingerprint, self.shared.max_depth()).await
    }

    /// Returning-visitor entry point: the respondent behind the session
    /// token, else the one recognised by fingerprint, else a new anonymous
    /// respondent. The boolean is `true` when a respondent was created.
    pub async fn get_or_create_respondent(
        &self,
        session_token: &str,
        fingerprint: Option<String>,
        explicit: ExplicitAttributes,
        ctx: &RequestContext,
    ) -> Result<(Respondent, bool), EngineError> {
        validate_session_token(session_token)?;
        let max_depth = self.shared.max_depth();
        {
            let mut tx = self.shared.store.begin().await?;
            if let Some(found) = tx.find_respondent_by_session(session_token).await? {
                let canonical = resolve_in(tx.as_mut(), found.id, max_depth).await?;
                debug!("Session of respondent {} recognised", canonical.id);
                return Ok((canonical, false));
            }
            if let Some(fp) = fingerprint.as_deref() {
                if let Some(canonical) = fingerprint_match_in(tx.as_mut(), fp, max_depth).await? {
                    debug!("Respondent {} recognised by fingerprint", canonical.id);
                    return Ok((canonical, false));
                }
            }
        }
        let created = self
            .create_anonymous_respondent(session_token, fingerprint, explicit, ctx)
            .await?;
        Ok((created, true))
    }

    /// Links the canonical respondent behind `respondent_id` to `user_id`.
    /// Linking to the same user twice is a no-op.
    pub async fn link_to_user(
        &self,
        respondent_id: Uuid,
        user_id: Uuid,
        ctx: &RequestContext,
    ) -> Result<Respondent, EngineError> {
        let now = self.shared.now();
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
        let mut respondent =
            resolve_locked_in(tx.as_mut(), respondent_id, self.shared.max_depth()).await?;
        require_live(&respondent)?;
        if link_in(tx.as_mut(), &mut respondent, user_id, ctx, now).await? {
            tx.commit().await?;
        }
        Ok(respondent)
    }

    /// Non-merged, non-deleted respondents linked to the user.
    pub async fn get_respondents_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Respondent>, EngineError> {
        let mut tx = self.shared.store.begin().await?;
        tx.respondents_for_user(user_id, false).await
    }

    pub async fn touch_respondent(&self, respondent_id: Uuid) -> Result<Respondent, EngineError> {
        let now = self.shared.now();
        let mut tx = self.shared.store.begin().await?;
        let mut respondent =
            resolve_locked_in(tx.as_mut(), respondent_id, self.shared.max_depth()).await?;
        require_live(&respondent)?;
        respondent.last_activity_at = respondent.last_activity_at.max(now);
        tx.update_respondent(&respondent).await?;
        tx.commit().await?;
        Ok(respondent)
    }

    /// Stores a precise location, which requires granted `location` consent in
    /// the given scope (survey-specific, falling back to global).
    pub async fn record_precise_location(
        &self,
        respondent_id: Uuid,
        survey_id: Option<Uuid>,
        location: PreciseLocation,
        ctx: &RequestContext,
    ) -> Result<Respondent, EngineError> {
        validate_location(&location)?;
        let now = self.shared.now();
        let max_depth = self.shared.max_depth();
        let mut tx = self.shared.store.begin().await?;
        let mut respondent = resolve_locked_in(tx.as_mut(), respondent_id, max_depth).await?;
        require_live(&respondent)?;
        require_consent_in(
            tx.as_mut(),
            respondent.id,
            DataCategory::Location,
            survey_id,
            max_depth,
        )
        .await?;

        respondent.permissioned.precise_location = Some(location);
        respondent.last_activity_at = respondent.last_activity_at.max(now);
        tx.update_respondent(&respondent).await?;
        append_in(
            tx.as_mut(),
            respondent.id,
            EventKind::LocationUpdated,
            json!({
                "survey_id": survey_id,
                "location_type": "precise",
                "accuracy_m": location.accuracy_m,
            }),
            ctx,
            now,
        )
        .await?;
        tx.commit().await?;
        Ok(respondent)
    }

    /// Stores a device-sensor reading (motion, orientation and the like),
    /// which requires granted `device_info` consent in the given scope.
    pub async fn record_device_sensors(
        &self,
        respondent_id: Uuid,
        survey_id: Option<Uuid>,
        sensors: Value,
        ctx: &RequestContext,
    ) -> Result<Respondent, EngineError> {
        if !sensors.is_object() {
            return Err(EngineError::Validation(
                "Device sensor data must be a JSON object".to_string(),
            ));
        }
        let now = self.shared.now();
        let max_depth = self.shared.max_depth();
        let mut tx = self.shared.store.begin().await?;
        let mut respondent = resolve_locked_in(tx.as_mut(), respondent_id, max_depth).await?;
        require_live(&respondent)?;
        require_consent_in(
            tx.as_mut(),
            respondent.id,
            DataCategory::DeviceInfo,
            survey_id,
            max_depth,
        )
        .await?;

        let sensor_names: Vec<String> = sensors
            .as_object()
            .map(|fields| fields.keys().cloned().collect())
            .unwrap_or_default();
        respondent.permissioned.device_sensors = Some(sensors);
        respondent.last_activity_at = respondent.last_activity_at.max(now);
        tx.update_respondent(&respondent).await?;
        append_in(
            tx.as_mut(),
            respondent.id,
            EventKind::SensorsUpdated,
            json!({ "survey_id": survey_id, "sensors": sensor_names }),
            ctx,
            now,
        )
        .await?;
        tx.commit().await?;
        Ok(respondent)
    }

    /// Erasure request: soft-deletes every respondent of the merge group and
    /// clears their permissioned attributes. Ledger rows are retained.
    pub async fn soft_delete_respondent(
        &self,
        respondent_id: Uuid,
        ctx: &RequestContext,
    ) -> Result<Vec<Uuid>, EngineError> {
        let now = self.shared.now();
        let max_depth = self.shared.max_depth();
        let mut tx = self.shared.store.begin().await?;
        let canonical = resolve_locked_in(tx.as_mut(), respondent_id, max_depth).await?;
        require_live(&canonical)?;

        let group = merge_group_in(tx.as_mut(), canonical.id, max_depth).await?;
        for id in &group {
            let mut member = tx
                .get_respondent(*id)
                .await?
                .ok_or_else(|| EngineError::respondent_not_found(*id))?;
            member.is_deleted = true;
            member.deleted_at = Some(now);
            member.is_active = false;
            member.permissioned = PermissionedAttributes::default();
            tx.update_respondent(&member).await?;
        }
        append_in(
            tx.as_mut(),
            canonical.id,
            EventKind::DataDeleted,
            json!({ "deletion_type": "erasure_request", "deleted_ids": group }),
            ctx,
            now,
        )
        .await?;
        tx.commit().await?;

        info!(
            "Soft-deleted respondent {} and {} merged source(s)",
            canonical.id,
            group.len() - 1
        );
        Ok(group)
    }
}
