//! Assignment dispatch: turning ranked candidates into offer records.
//!
//! The dispatcher owns assignment creation (with the phase-exclusivity
//! invariant checked before insert), the coarse distribution audit trail,
//! and notification emission. Notification delivery is fire-and-forget:
//! the offer timer runs from `phase_started_at`, never from delivery
//! success, so retries cannot stretch a window.

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{Config, RoutingConfig};
use crate::errors::AppError;
use crate::metrics::MetricsStore;
use crate::models::{Lead, LeadAssignment, LeadPhase};
use crate::notifier::{LeadSummary, NotificationService, PerformerNotification};
use crate::scheduler::phase_window;
use crate::selector::ScoredCandidate;

/// Derive the unique response-link token for an assignment.
///
/// Deterministic per (secret, assignment), so a re-sent notification carries
/// the same link as the original.
pub fn response_token(assignment_id: Uuid, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(assignment_id.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct AssignmentDispatcher {
    pool: PgPool,
    routing: RoutingConfig,
    token_secret: String,
    notifier: Arc<NotificationService>,
}

impl AssignmentDispatcher {
    pub fn new(pool: PgPool, config: &Config, notifier: Arc<NotificationService>) -> Self {
        Self {
            pool,
            routing: config.routing.clone(),
            token_secret: config.response_token_secret.clone(),
            notifier,
        }
    }

    /// Create assignment records for a phase and emit a notification request
    /// per assignment.
    ///
    /// Validates the phase-exclusivity invariants before insert: no candidate
    /// may already hold an outstanding assignment on this lead, an exclusive
    /// phase admits exactly one outstanding assignment, and no candidate may
    /// be suspended or cooling down (the selector filters those; seeing one
    /// here is an internal-consistency failure, not a user error).
    pub async fn dispatch(
        &self,
        lead: &Lead,
        candidates: &[ScoredCandidate],
        phase: LeadPhase,
    ) -> Result<Vec<LeadAssignment>, AppError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        if phase == LeadPhase::Exclusive && candidates.len() > 1 {
            return Err(AppError::InvariantViolation(format!(
                "Exclusive phase dispatch for lead {} with {} candidates",
                lead.id,
                candidates.len()
            )));
        }

        let outstanding: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM lead_assignments \
             WHERE lead_id = $1 AND response_status = 'pending'",
        )
        .bind(lead.id)
        .fetch_one(&self.pool)
        .await?;
        if outstanding.0 > 0 {
            return Err(AppError::InvariantViolation(format!(
                "Lead {} still has {} outstanding assignment(s); cannot dispatch phase {}",
                lead.id,
                outstanding.0,
                phase.as_str()
            )));
        }

        let ids: Vec<Uuid> = candidates.iter().map(|c| c.performer_id).collect();
        let ineligible: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT performer_id FROM performer_routing_metrics \
             WHERE performer_id = ANY($1) \
               AND (is_suspended OR (cooldown_until IS NOT NULL AND cooldown_until > NOW()))",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        if let Some((performer_id,)) = ineligible.first() {
            return Err(AppError::InvariantViolation(format!(
                "Attempted to assign lead {} to ineligible performer {}",
                lead.id, performer_id
            )));
        }

        let now = Utc::now();
        let expires_at = now + phase_window(&self.routing, phase);
        let exclusivity_until = match phase {
            LeadPhase::Exclusive => Some(expires_at),
            _ => None,
        };

        let metrics_store = MetricsStore::new(self.pool.clone(), self.routing.clone());
        let mut created = Vec::with_capacity(candidates.len());

        for (priority, candidate) in candidates.iter().enumerate() {
            let assignment_id = Uuid::new_v4();
            let token = response_token(assignment_id, &self.token_secret);

            let assignment = sqlx::query_as::<_, LeadAssignment>(
                "INSERT INTO lead_assignments \
                   (id, lead_id, performer_id, phase, priority, phase_started_at, \
                    phase_expires_at, exclusivity_until, notified_at, response_status, \
                    routing_score_at_assignment, score_breakdown, response_token, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $6, 'pending', $9, $10, $11, $6) \
                 RETURNING *",
            )
            .bind(assignment_id)
            .bind(lead.id)
            .bind(candidate.performer_id)
            .bind(phase)
            .bind(priority as i32)
            .bind(now)
            .bind(expires_at)
            .bind(exclusivity_until)
            .bind(candidate.score)
            .bind(sqlx::types::Json(candidate.breakdown))
            .bind(&token)
            .fetch_one(&self.pool)
            .await?;

            // Coarse audit trail, independent of phase granularity.
            sqlx::query(
                "INSERT INTO lead_distributions (id, lead_id, performer_id, contacted_at, created_at) \
                 VALUES ($1, $2, $3, $4, $4) \
                 ON CONFLICT (lead_id, performer_id) DO UPDATE SET contacted_at = EXCLUDED.contacted_at",
            )
            .bind(Uuid::new_v4())
            .bind(lead.id)
            .bind(candidate.performer_id)
            .bind(now)
            .execute(&self.pool)
            .await?;

            metrics_store.record_routed(candidate.performer_id).await?;

            let notification = PerformerNotification {
                performer_id: candidate.performer_id,
                assignment_id,
                lead: LeadSummary::from_lead(lead),
                expires_at,
                response_token: token,
            };
            let notifier = Arc::clone(&self.notifier);
            tokio::spawn(async move {
                if let Err(e) = notifier.notify_performer(&notification).await {
                    // Recoverable: the collaborator retries on its side and
                    // the offer timer keeps running from phase_started_at.
                    tracing::warn!(
                        "Notification for assignment {} failed: {}",
                        notification.assignment_id,
                        e
                    );
                }
            });

            created.push(assignment);
        }

        tracing::info!(
            "Dispatched {} {} assignment(s) for lead {} (window ends {})",
            created.len(),
            phase.as_str(),
            lead.id,
            expires_at
        );
        Ok(created)
    }

    /// Exposure stamp: the performer opened the lead. Feeds the
    /// ignored-vs-expired distinction at window lapse.
    pub async fn record_viewed(&self, assignment_id: Uuid) -> Result<(), AppError> {
        let row: Option<(Uuid, Uuid)> = sqlx::query_as(
            "SELECT lead_id, performer_id FROM lead_assignments WHERE id = $1",
        )
        .bind(assignment_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some((lead_id, performer_id)) = row else {
            return Err(AppError::NotFound(format!(
                "Assignment {} not found",
                assignment_id
            )));
        };

        sqlx::query(
            "UPDATE lead_distributions SET viewed_at = COALESCE(viewed_at, NOW()) \
             WHERE lead_id = $1 AND performer_id = $2",
        )
        .bind(lead_id)
        .bind(performer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_token_is_deterministic_per_assignment() {
        let id = Uuid::new_v4();
        let a = response_token(id, "secret-key-0123456789");
        let b = response_token(id, "secret-key-0123456789");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let other = response_token(Uuid::new_v4(), "secret-key-0123456789");
        assert_ne!(a, other);

        let other_secret = response_token(id, "different-secret-9876");
        assert_ne!(a, other_secret);
    }
}
