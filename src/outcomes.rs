//! Outcome recording: performer responses, win resolution, conversions.
//!
//! All win resolution for a lead serializes on the lead row lock, so two
//! acceptances racing within the same broadcast phase commit in server
//! receive order: exactly one wins, the rest resolve as not-the-winner and
//! skip their side effects. Duplicate deliveries of the same response are
//! idempotent no-ops against an already-terminal assignment.

use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::errors::AppError;
use crate::metrics::MetricsStore;
use crate::models::{Lead, LeadAssignment, Outcome, ResponseAction, RoutingState};
use crate::notifier::NotificationService;
use crate::scheduler::PhaseScheduler;

/// How a performer response resolved. Never surfaced as a failure to the
/// responding performer; the UI collaborator renders each case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResolution {
    /// Acceptance won the lead.
    Won,
    /// Decline recorded.
    Declined,
    /// The assignment was already terminal; nothing changed.
    AlreadyResolved,
    /// Acceptance arrived after the lead was resolved another way; the
    /// assignment closed as expired and the caller must skip side effects.
    NotWinner,
}

pub struct OutcomeRecorder {
    pool: PgPool,
    config: Config,
    notifier: Arc<NotificationService>,
}

impl OutcomeRecorder {
    pub fn new(pool: PgPool, config: Config, notifier: Arc<NotificationService>) -> Self {
        Self {
            pool,
            config,
            notifier,
        }
    }

    /// Record a performer's response to an assignment.
    ///
    /// Token, when present, must match the assignment's response token.
    /// Responses against terminal assignments are logged no-ops, which makes
    /// duplicate webhook delivery safe.
    pub async fn record_response(
        &self,
        assignment_id: Uuid,
        action: ResponseAction,
        token: Option<&str>,
        decline_reason: Option<String>,
    ) -> Result<ResponseResolution, AppError> {
        let assignment = sqlx::query_as::<_, LeadAssignment>(
            "SELECT * FROM lead_assignments WHERE id = $1",
        )
        .bind(assignment_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Assignment {} not found", assignment_id)))?;

        if let Some(token) = token {
            if token != assignment.response_token {
                return Err(AppError::Unauthorized(
                    "Response token does not match assignment".to_string(),
                ));
            }
        }

        if assignment.response_status.is_terminal() {
            tracing::info!(
                "Duplicate/late response {:?} for terminal assignment {} ({:?}); no-op",
                action,
                assignment_id,
                assignment.response_status
            );
            return Ok(ResponseResolution::AlreadyResolved);
        }

        match action {
            ResponseAction::Accept => self.record_accept(&assignment).await,
            ResponseAction::Decline => self.record_decline(&assignment, decline_reason).await,
        }
    }

    /// Resolve an acceptance. The lead row lock is the per-lead mutex: the
    /// first acceptance to take it while the lead is still routing wins, and
    /// force-expires every sibling offer so none can produce a second winner.
    async fn record_accept(
        &self,
        assignment: &LeadAssignment,
    ) -> Result<ResponseResolution, AppError> {
        let mut tx = self.pool.begin().await?;

        let lead = sqlx::query_as::<_, Lead>("SELECT * FROM leads WHERE id = $1 FOR UPDATE")
            .bind(assignment.lead_id)
            .fetch_one(&mut *tx)
            .await?;

        let now = Utc::now();
        let latency = (now - assignment.notified_at.unwrap_or(assignment.phase_started_at))
            .num_seconds()
            .max(0) as f64;

        if lead.routing_state != RoutingState::Routing {
            // Late acceptance: the lead was already resolved (won by a
            // sibling, withdrawn, or swept). Close the offer without a win.
            let closed = sqlx::query(
                "UPDATE lead_assignments SET response_status = 'expired', responded_at = $2 \
                 WHERE id = $1 AND response_status = 'pending'",
            )
            .bind(assignment.id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            if closed.rows_affected() == 0 {
                return Ok(ResponseResolution::AlreadyResolved);
            }
            tracing::info!(
                "Acceptance for assignment {} lost the race; lead {} is {:?}",
                assignment.id,
                lead.id,
                lead.routing_state
            );
            return Ok(ResponseResolution::NotWinner);
        }

        let accepted = sqlx::query(
            "UPDATE lead_assignments SET response_status = 'accepted', responded_at = $2, \
             response_latency_secs = $3 \
             WHERE id = $1 AND response_status = 'pending'",
        )
        .bind(assignment.id)
        .bind(now)
        .bind(latency)
        .execute(&mut *tx)
        .await?;
        if accepted.rows_affected() == 0 {
            // Swept to expired between our snapshot read and the lock.
            tx.commit().await?;
            return Ok(ResponseResolution::AlreadyResolved);
        }

        sqlx::query(
            "UPDATE leads SET routing_state = 'assigned', assigned_performer_id = $2, \
             phase_deadline = NULL, updated_at = $3 WHERE id = $1",
        )
        .bind(lead.id)
        .bind(assignment.performer_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // Force-expire every sibling offer; their own timers must not fire a
        // second winner.
        let siblings = sqlx::query(
            "UPDATE lead_assignments SET response_status = 'expired' \
             WHERE lead_id = $1 AND id <> $2 AND response_status = 'pending'",
        )
        .bind(lead.id)
        .bind(assignment.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE lead_distributions SET accepted_at = $3 \
             WHERE lead_id = $1 AND performer_id = $2",
        )
        .bind(lead.id)
        .bind(assignment.performer_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let metrics = MetricsStore::new(self.pool.clone(), self.config.routing.clone());
        metrics
            .record_outcome(assignment.performer_id, Outcome::Accepted)
            .await?;

        tracing::info!(
            "Lead {} assigned to performer {} via assignment {} ({} sibling offer(s) expired)",
            lead.id,
            assignment.performer_id,
            assignment.id,
            siblings.rows_affected()
        );
        self.emit_state(lead.id, RoutingState::Assigned);
        Ok(ResponseResolution::Won)
    }

    /// Record a decline and advance the phase if it was the last outstanding
    /// offer.
    async fn record_decline(
        &self,
        assignment: &LeadAssignment,
        decline_reason: Option<String>,
    ) -> Result<ResponseResolution, AppError> {
        let mut tx = self.pool.begin().await?;

        // Same per-lead serialization as acceptance, so a decline can't
        // interleave with a win resolution on the sibling offers.
        sqlx::query("SELECT id FROM leads WHERE id = $1 FOR UPDATE")
            .bind(assignment.lead_id)
            .execute(&mut *tx)
            .await?;

        let now = Utc::now();
        let latency = (now - assignment.notified_at.unwrap_or(assignment.phase_started_at))
            .num_seconds()
            .max(0) as f64;

        let declined = sqlx::query(
            "UPDATE lead_assignments SET response_status = 'declined', responded_at = $2, \
             response_latency_secs = $3 \
             WHERE id = $1 AND response_status = 'pending'",
        )
        .bind(assignment.id)
        .bind(now)
        .bind(latency)
        .execute(&mut *tx)
        .await?;
        if declined.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(ResponseResolution::AlreadyResolved);
        }

        sqlx::query(
            "UPDATE lead_distributions SET declined_at = $3, decline_reason = $4 \
             WHERE lead_id = $1 AND performer_id = $2",
        )
        .bind(assignment.lead_id)
        .bind(assignment.performer_id)
        .bind(now)
        .bind(&decline_reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let metrics = MetricsStore::new(self.pool.clone(), self.config.routing.clone());
        metrics
            .record_outcome(assignment.performer_id, Outcome::Declined)
            .await?;

        tracing::info!(
            "Performer {} declined assignment {} for lead {}",
            assignment.performer_id,
            assignment.id,
            assignment.lead_id
        );

        // If that was the phase's last outstanding offer, move on now rather
        // than waiting for the sweep.
        let scheduler = PhaseScheduler::new(
            self.pool.clone(),
            self.config.clone(),
            Arc::clone(&self.notifier),
        );
        scheduler.advance_after_phase(assignment.lead_id).await?;

        Ok(ResponseResolution::Declined)
    }

    /// Attribute a confirmed booking back to the accepted assignment.
    ///
    /// Arrives asynchronously from the billing/CRM collaborator, possibly
    /// long after acceptance. Idempotent: converting an already-converted
    /// lead is a no-op.
    pub async fn mark_converted(
        &self,
        lead_id: Uuid,
        performer_id: Uuid,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let lead = sqlx::query_as::<_, Lead>("SELECT * FROM leads WHERE id = $1 FOR UPDATE")
            .bind(lead_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", lead_id)))?;

        if lead.routing_state == RoutingState::Converted {
            tx.commit().await?;
            tracing::info!("Lead {} already converted; no-op", lead_id);
            return Ok(());
        }
        if lead.routing_state != RoutingState::Assigned {
            tx.commit().await?;
            return Err(AppError::BadRequest(format!(
                "Lead {} is {:?}, not assigned; cannot convert",
                lead_id, lead.routing_state
            )));
        }
        if lead.assigned_performer_id != Some(performer_id) {
            tx.commit().await?;
            return Err(AppError::BadRequest(format!(
                "Lead {} is not assigned to performer {}",
                lead_id, performer_id
            )));
        }

        // The accepted assignment this conversion attributes to must exist;
        // an assigned lead without one is an internal inconsistency.
        let attributed: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM lead_assignments \
             WHERE lead_id = $1 AND performer_id = $2 AND response_status = 'accepted'",
        )
        .bind(lead_id)
        .bind(performer_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((assignment_id,)) = attributed else {
            tx.commit().await?;
            return Err(AppError::InvariantViolation(format!(
                "Lead {} assigned to {} but no accepted assignment exists",
                lead_id, performer_id
            )));
        };

        sqlx::query(
            "UPDATE leads SET routing_state = 'converted', updated_at = NOW() WHERE id = $1",
        )
        .bind(lead_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let metrics = MetricsStore::new(self.pool.clone(), self.config.routing.clone());
        metrics
            .record_outcome(performer_id, Outcome::Converted)
            .await?;

        tracing::info!(
            "Lead {} converted; booking attributed to assignment {} (performer {})",
            lead_id,
            assignment_id,
            performer_id
        );
        self.emit_state(lead_id, RoutingState::Converted);
        Ok(())
    }

    fn emit_state(&self, lead_id: Uuid, state: RoutingState) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.emit_state_changed(lead_id, state).await {
                tracing::warn!("Routing event for lead {} failed: {}", lead_id, e);
            }
        });
    }
}
