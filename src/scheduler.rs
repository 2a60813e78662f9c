//! Phase scheduler: the state machine driving a lead through exclusivity
//! phases, and the sweep that detects lapsed offer windows.
//!
//! Phase transitions and expiry both commit through conditional updates
//! (`WHERE routing_state = 'routing' AND current_phase = ...`), so a sweep
//! racing a late acceptance or a concurrent advance can never double-run a
//! phase: exactly one writer claims each transition.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{Config, RoutingConfig};
use crate::dispatcher::AssignmentDispatcher;
use crate::errors::AppError;
use crate::metrics::MetricsStore;
use crate::models::{Lead, LeadPhase, Outcome, RoutingState};
use crate::notifier::NotificationService;
use crate::selector::CandidateSelector;

/// Reason recorded when routing ends without a winner.
pub const REASON_NO_CANDIDATES: &str = "no_eligible_performers";
pub const REASON_ALL_PHASES_LAPSED: &str = "all_phases_lapsed";

/// Offer window for a phase.
pub fn phase_window(config: &RoutingConfig, phase: LeadPhase) -> Duration {
    match phase {
        LeadPhase::Exclusive => Duration::minutes(config.exclusive_window_minutes),
        LeadPhase::Broadcast => Duration::minutes(config.broadcast_window_minutes),
        LeadPhase::Open => Duration::hours(config.open_window_hours),
    }
}

/// Outcome of an offer whose window lapsed without a response: viewed-but-
/// silent counts as ignored (feeds the anti-abuse penalty), never-viewed
/// offers merely expire.
pub fn lapse_outcome(viewed: bool) -> Outcome {
    if viewed {
        Outcome::Ignored
    } else {
        Outcome::Expired
    }
}

/// How many candidates a phase may offer to at once.
pub fn phase_capacity(config: &RoutingConfig, phase: LeadPhase) -> usize {
    match phase {
        LeadPhase::Exclusive => 1,
        LeadPhase::Broadcast => config.broadcast_fan_out,
        LeadPhase::Open => config.open_phase_cap,
    }
}

pub struct PhaseScheduler {
    pool: PgPool,
    config: Config,
    notifier: Arc<NotificationService>,
}

impl PhaseScheduler {
    pub fn new(pool: PgPool, config: Config, notifier: Arc<NotificationService>) -> Self {
        Self {
            pool,
            config,
            notifier,
        }
    }

    /// Move a pending lead into routing and open the exclusive phase.
    ///
    /// The pending→routing transition is conditional, so a lead can only be
    /// initialized once even under duplicate submission retries.
    pub async fn start_routing(&self, lead_id: Uuid) -> Result<Lead, AppError> {
        let lead = sqlx::query_as::<_, Lead>(
            "UPDATE leads SET routing_state = 'routing', routed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND routing_state = 'pending' RETURNING *",
        )
        .bind(lead_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            AppError::NotWinner(format!("Lead {} is not pending; routing not started", lead_id))
        })?;

        self.emit_state(lead.id, RoutingState::Routing);
        self.enter_phase(&lead, LeadPhase::Exclusive, None).await?;
        Ok(lead)
    }

    /// Enter `phase` for a lead, falling through to later phases when no new
    /// candidates remain, and exhausting the lead when the ladder runs out.
    ///
    /// `from_phase` is the phase this transition claims to leave; the claim
    /// is a conditional update, and losing it means another writer already
    /// advanced (or resolved) the lead, which is not an error.
    pub async fn enter_phase(
        &self,
        lead: &Lead,
        phase: LeadPhase,
        from_phase: Option<LeadPhase>,
    ) -> Result<(), AppError> {
        let selector = CandidateSelector::new(self.pool.clone(), self.config.routing.clone());
        let dispatcher = AssignmentDispatcher::new(
            self.pool.clone(),
            &self.config,
            Arc::clone(&self.notifier),
        );

        // A fresh ladder that never dispatches anything exhausts with the
        // no-candidates reason; a mid-ladder advance that runs dry lapsed.
        let started_fresh = from_phase.is_none() && phase == LeadPhase::Exclusive;
        let mut current = phase;
        let mut claim_from = from_phase;
        loop {
            let deadline = Utc::now() + phase_window(&self.config.routing, current);
            if !self.claim_phase(lead.id, claim_from, current, deadline).await? {
                tracing::debug!(
                    "Lead {} phase claim to {} lost; another writer advanced it",
                    lead.id,
                    current.as_str()
                );
                return Ok(());
            }

            let ranked = selector.select_candidates(lead).await?;
            if !ranked.is_empty() {
                let capacity = phase_capacity(&self.config.routing, current);
                let offered = &ranked[..capacity.min(ranked.len())];
                let created = dispatcher.dispatch(lead, offered, current).await?;

                // Pin the lead's deadline to the actual assignment window.
                if let Some(first) = created.first() {
                    sqlx::query(
                        "UPDATE leads SET phase_deadline = $2, updated_at = NOW() \
                         WHERE id = $1 AND routing_state = 'routing'",
                    )
                    .bind(lead.id)
                    .bind(first.phase_expires_at)
                    .execute(&self.pool)
                    .await?;
                }
                return Ok(());
            }

            match current.next() {
                Some(next) => {
                    tracing::info!(
                        "Lead {}: no new candidates for {} phase, falling through to {}",
                        lead.id,
                        current.as_str(),
                        next.as_str()
                    );
                    claim_from = Some(current);
                    current = next;
                }
                None => {
                    let reason = if started_fresh {
                        REASON_NO_CANDIDATES
                    } else {
                        REASON_ALL_PHASES_LAPSED
                    };
                    self.exhaust(lead.id, reason).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Claim the transition into `to` from `from`. Returns false when the
    /// lead is no longer routing or another writer got there first.
    async fn claim_phase(
        &self,
        lead_id: Uuid,
        from: Option<LeadPhase>,
        to: LeadPhase,
        provisional_deadline: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE leads SET current_phase = $3, phase_deadline = $4, updated_at = NOW() \
             WHERE id = $1 AND routing_state = 'routing' \
               AND current_phase IS NOT DISTINCT FROM $2",
        )
        .bind(lead_id)
        .bind(from)
        .bind(to)
        .bind(provisional_deadline)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Advance a routing lead past its current phase once it has no
    /// outstanding assignments. Called by the outcome recorder when the last
    /// offer in a phase resolves negatively, and by the expiry sweep.
    pub async fn advance_after_phase(&self, lead_id: Uuid) -> Result<(), AppError> {
        let Some(lead) = sqlx::query_as::<_, Lead>("SELECT * FROM leads WHERE id = $1")
            .bind(lead_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Err(AppError::NotFound(format!("Lead {} not found", lead_id)));
        };

        if lead.routing_state != RoutingState::Routing {
            return Ok(());
        }
        let Some(current) = lead.current_phase else {
            return Ok(());
        };

        let outstanding: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM lead_assignments \
             WHERE lead_id = $1 AND response_status = 'pending'",
        )
        .bind(lead_id)
        .fetch_one(&self.pool)
        .await?;
        if outstanding.0 > 0 {
            return Ok(());
        }

        match current.next() {
            Some(next) => self.enter_phase(&lead, next, Some(current)).await,
            None => self.exhaust(lead_id, REASON_ALL_PHASES_LAPSED).await,
        }
    }

    /// Mark a routing lead exhausted. Conditional: terminal leads are left
    /// untouched.
    pub async fn exhaust(&self, lead_id: Uuid, reason: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE leads SET routing_state = 'exhausted', exhausted_reason = $2, \
             phase_deadline = NULL, updated_at = NOW() \
             WHERE id = $1 AND routing_state = 'routing'",
        )
        .bind(lead_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            tracing::info!("Lead {} exhausted: {}", lead_id, reason);
            self.emit_state(lead_id, RoutingState::Exhausted);
        }
        Ok(())
    }

    /// One sweep pass: resolve every pending assignment whose window lapsed,
    /// then advance the affected leads. Returns how many offers were closed.
    ///
    /// Each assignment closes through its own conditional update, so a
    /// response that commits before the sweep reaches it always wins; once
    /// the sweep commits, later responses are idempotent no-ops.
    pub async fn run_expiry_sweep(&self) -> Result<u64, AppError> {
        let lapsed: Vec<(Uuid, Uuid, Uuid, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT a.id, a.lead_id, a.performer_id, d.viewed_at \
             FROM lead_assignments a \
             LEFT JOIN lead_distributions d \
               ON d.lead_id = a.lead_id AND d.performer_id = a.performer_id \
             WHERE a.response_status = 'pending' AND a.phase_expires_at <= NOW() \
             ORDER BY a.phase_expires_at",
        )
        .fetch_all(&self.pool)
        .await?;

        if lapsed.is_empty() {
            return Ok(0);
        }

        let metrics = MetricsStore::new(self.pool.clone(), self.config.routing.clone());
        let mut closed = 0u64;
        let mut touched_leads: Vec<Uuid> = Vec::new();

        for (assignment_id, lead_id, performer_id, viewed_at) in lapsed {
            let outcome = lapse_outcome(viewed_at.is_some());
            let status = match outcome {
                Outcome::Ignored => "ignored",
                _ => "expired",
            };

            let result = sqlx::query(
                "UPDATE lead_assignments SET response_status = $2::response_status \
                 WHERE id = $1 AND response_status = 'pending'",
            )
            .bind(assignment_id)
            .bind(status)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                closed += 1;
                metrics.record_outcome(performer_id, outcome).await?;
                if !touched_leads.contains(&lead_id) {
                    touched_leads.push(lead_id);
                }
                tracing::info!(
                    "Assignment {} lapsed ({}) for performer {}",
                    assignment_id,
                    status,
                    performer_id
                );
            }
        }

        for lead_id in touched_leads {
            if let Err(e) = self.advance_after_phase(lead_id).await {
                tracing::error!("Failed to advance lead {} after sweep: {}", lead_id, e);
            }
        }

        Ok(closed)
    }

    /// Run the expiry sweep forever at the configured interval. Spawned once
    /// at startup; errors are logged and the loop keeps going.
    pub async fn run_sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.config.routing.sweep_interval_secs,
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.run_expiry_sweep().await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Expiry sweep closed {} lapsed offer(s)", n),
                Err(e) => tracing::error!("Expiry sweep failed: {}", e),
            }
        }
    }

    /// Fire-and-forget routing event for CRM/dashboard collaborators.
    fn emit_state(&self, lead_id: Uuid, state: RoutingState) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.emit_state_changed(lead_id, state).await {
                tracing::warn!("Routing event for lead {} failed: {}", lead_id, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_ladder_ends_at_open() {
        assert_eq!(LeadPhase::Exclusive.next(), Some(LeadPhase::Broadcast));
        assert_eq!(LeadPhase::Broadcast.next(), Some(LeadPhase::Open));
        assert_eq!(LeadPhase::Open.next(), None);
    }

    #[test]
    fn windows_follow_config() {
        let config = RoutingConfig::default();
        assert_eq!(
            phase_window(&config, LeadPhase::Exclusive),
            Duration::minutes(30)
        );
        assert_eq!(
            phase_window(&config, LeadPhase::Broadcast),
            Duration::minutes(240)
        );
        assert_eq!(phase_window(&config, LeadPhase::Open), Duration::hours(48));
    }

    #[test]
    fn capacities_follow_config() {
        let mut config = RoutingConfig::default();
        config.broadcast_fan_out = 3;
        config.open_phase_cap = 12;
        assert_eq!(phase_capacity(&config, LeadPhase::Exclusive), 1);
        assert_eq!(phase_capacity(&config, LeadPhase::Broadcast), 3);
        assert_eq!(phase_capacity(&config, LeadPhase::Open), 12);
    }
}
