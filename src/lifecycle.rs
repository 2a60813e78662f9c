//! Lead lifecycle: validated intake, routing kickoff, withdrawal,
//! re-injection and status queries.
//!
//! Validation failures reject synchronously and never enter routing state.
//! A submission with no eligible performers still succeeds: the lead lands
//! in `exhausted` with a recorded reason for CRM follow-up, which is a valid
//! terminal condition rather than an error.

use bigdecimal::{BigDecimal, FromPrimitive};
use chrono::Utc;
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use regex::Regex;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::errors::{AppError, ResultExt};
use crate::metrics::MetricsStore;
use crate::models::{
    AssignmentView, Lead, LeadAssignment, LeadStatusResponse, Outcome, RoutingState,
    SubmitLeadRequest,
};
use crate::notifier::NotificationService;
use crate::scheduler::PhaseScheduler;
use crate::scoring::{form_completeness, is_last_minute, lead_quality_score};

/// Validate email address
///
/// Checks for:
/// - Basic email format (contains @ and .)
/// - Fake/placeholder patterns (repeated digits like 9999, 1111)
/// - Minimum length requirements
pub fn is_valid_email(email: &str) -> bool {
    // Basic checks
    if email.len() < 5 || !email.contains('@') || !email.contains('.') {
        return false;
    }

    // Detect fake patterns (repeated digits) common in junk inquiries
    let fake_patterns = ["999999", "111111", "000000", "123456789"];
    for pattern in &fake_patterns {
        if email.contains(pattern) {
            tracing::warn!("Invalid email detected (fake pattern '{}')", pattern);
            return false;
        }
    }

    // RFC 5322 simplified email regex
    let email_regex = Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$"
    ).unwrap();

    email_regex.is_match(email)
}

/// Validate and normalize a US planner phone number to E.164.
///
/// Returns `(valid, normalized)`; the normalized value is only meaningful
/// when valid.
pub fn validate_us_phone(raw: &str) -> (bool, String) {
    if raw.trim().is_empty() {
        return (false, String::new());
    }
    match phonenumber::parse(Some(CountryId::US), raw) {
        Ok(number) => {
            if phonenumber::is_valid(&number) {
                (true, number.format().mode(Mode::E164).to_string())
            } else {
                (false, String::new())
            }
        }
        Err(_) => (false, String::new()),
    }
}

pub struct LeadLifecycleManager {
    pool: PgPool,
    config: Config,
    notifier: Arc<NotificationService>,
}

impl LeadLifecycleManager {
    pub fn new(pool: PgPool, config: Config, notifier: Arc<NotificationService>) -> Self {
        Self {
            pool,
            config,
            notifier,
        }
    }

    fn scheduler(&self) -> PhaseScheduler {
        PhaseScheduler::new(
            self.pool.clone(),
            self.config.clone(),
            Arc::clone(&self.notifier),
        )
    }

    /// Validate and persist a new lead, then start routing it.
    ///
    /// Returns the lead in its post-kickoff state: `routing` when offers went
    /// out, `exhausted` immediately when nobody was eligible.
    pub async fn submit_lead(&self, req: SubmitLeadRequest) -> Result<Lead, AppError> {
        Self::validate(&req)?;

        let planner_phone = match req.planner_phone.as_deref() {
            Some(raw) => {
                let (valid, normalized) = validate_us_phone(raw);
                if !valid {
                    return Err(AppError::BadRequest(format!(
                        "planner_phone '{}' is not a valid US phone number",
                        raw
                    )));
                }
                Some(normalized)
            }
            None => None,
        };

        let today = Utc::now().date_naive();
        let budget_midpoint = match (req.budget_min, req.budget_max) {
            (Some(min), Some(max)) => Some((min + max) / 2.0),
            (Some(min), None) => Some(min),
            (None, Some(max)) => Some(max),
            (None, None) => None,
        };
        let last_minute = is_last_minute(req.event_date, today);
        let completeness = form_completeness(&req);
        let score = lead_quality_score(
            budget_midpoint,
            &req.event_type,
            req.event_date.is_some(),
            req.venue_name.is_some(),
            planner_phone.is_some(),
            req.guest_count,
            last_minute,
        );

        let lead = sqlx::query_as::<_, Lead>(
            "INSERT INTO leads \
               (id, event_type, event_date, event_time, city, state, venue_name, guest_count, \
                budget_min, budget_max, budget_midpoint, planner_name, planner_email, \
                planner_phone, special_requests, is_last_minute, form_completeness, lead_score, \
                routing_state, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                     $17, $18, 'pending', NOW()) \
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(req.event_type.trim())
        .bind(req.event_date)
        .bind(&req.event_time)
        .bind(req.city.trim())
        .bind(&req.state)
        .bind(&req.venue_name)
        .bind(req.guest_count)
        .bind(req.budget_min.and_then(BigDecimal::from_f64))
        .bind(req.budget_max.and_then(BigDecimal::from_f64))
        .bind(budget_midpoint.and_then(BigDecimal::from_f64))
        .bind(req.planner_name.trim())
        .bind(req.planner_email.trim())
        .bind(&planner_phone)
        .bind(&req.special_requests)
        .bind(last_minute)
        .bind(completeness)
        .bind(score)
        .fetch_one(&self.pool)
        .await
        .context("Failed to persist submitted lead")?;

        tracing::info!(
            "Lead {} submitted ({} in {}, score {}, completeness {}%)",
            lead.id,
            lead.event_type,
            lead.city,
            lead.lead_score,
            lead.form_completeness
        );

        self.scheduler().start_routing(lead.id).await?;

        // Re-read: routing kickoff may have already exhausted the lead.
        let lead = sqlx::query_as::<_, Lead>("SELECT * FROM leads WHERE id = $1")
            .bind(lead.id)
            .fetch_one(&self.pool)
            .await?;
        Ok(lead)
    }

    /// Synchronous request validation. Malformed leads never enter routing.
    fn validate(req: &SubmitLeadRequest) -> Result<(), AppError> {
        if req.event_type.trim().is_empty() {
            return Err(AppError::BadRequest("event_type is required".to_string()));
        }
        if req.city.trim().is_empty() {
            return Err(AppError::BadRequest("city is required".to_string()));
        }
        if req.planner_name.trim().is_empty() {
            return Err(AppError::BadRequest("planner_name is required".to_string()));
        }
        if !is_valid_email(req.planner_email.trim()) {
            return Err(AppError::BadRequest(format!(
                "planner_email '{}' is not a valid email address",
                req.planner_email
            )));
        }
        if let Some(date) = req.event_date {
            if date < Utc::now().date_naive() {
                return Err(AppError::BadRequest(
                    "event_date cannot be in the past".to_string(),
                ));
            }
        }
        if let Some(guests) = req.guest_count {
            if guests <= 0 {
                return Err(AppError::BadRequest(
                    "guest_count must be positive".to_string(),
                ));
            }
        }
        match (req.budget_min, req.budget_max) {
            (Some(min), _) if min < 0.0 => {
                return Err(AppError::BadRequest("budget_min cannot be negative".to_string()))
            }
            (_, Some(max)) if max < 0.0 => {
                return Err(AppError::BadRequest("budget_max cannot be negative".to_string()))
            }
            (Some(min), Some(max)) if min > max => {
                return Err(AppError::BadRequest(
                    "budget_min cannot exceed budget_max".to_string(),
                ))
            }
            _ => {}
        }
        Ok(())
    }

    /// Planner-initiated withdrawal from any non-terminal state.
    ///
    /// Cancels every outstanding assignment so no further notifications go
    /// out and no timer can fire. Withdrawing an already-withdrawn lead is
    /// an idempotent no-op. Withdrawing an assigned lead records a lost lead
    /// against the assigned performer.
    pub async fn cancel_lead(&self, lead_id: Uuid) -> Result<Lead, AppError> {
        let mut tx = self.pool.begin().await?;

        let lead = sqlx::query_as::<_, Lead>("SELECT * FROM leads WHERE id = $1 FOR UPDATE")
            .bind(lead_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", lead_id)))?;

        match lead.routing_state {
            RoutingState::Withdrawn => {
                tx.commit().await?;
                tracing::info!("Lead {} already withdrawn; no-op", lead_id);
                return Ok(lead);
            }
            RoutingState::Exhausted | RoutingState::Converted => {
                tx.commit().await?;
                return Err(AppError::BadRequest(format!(
                    "Lead {} is {:?} and cannot be withdrawn",
                    lead_id, lead.routing_state
                )));
            }
            RoutingState::Pending | RoutingState::Routing | RoutingState::Assigned => {}
        }

        let lost_performer = if lead.routing_state == RoutingState::Assigned {
            lead.assigned_performer_id
        } else {
            None
        };

        let updated = sqlx::query_as::<_, Lead>(
            "UPDATE leads SET routing_state = 'withdrawn', phase_deadline = NULL, \
             updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(lead_id)
        .fetch_one(&mut *tx)
        .await?;

        // Force-expire outstanding offers. Planner withdrawal is not the
        // performer's doing, so these do not feed their metrics.
        let cancelled = sqlx::query(
            "UPDATE lead_assignments SET response_status = 'expired' \
             WHERE lead_id = $1 AND response_status = 'pending'",
        )
        .bind(lead_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if let Some(performer_id) = lost_performer {
            let metrics = MetricsStore::new(self.pool.clone(), self.config.routing.clone());
            metrics
                .record_outcome(performer_id, Outcome::LeadLost)
                .await?;
        }

        tracing::info!(
            "Lead {} withdrawn by planner ({} outstanding offer(s) cancelled)",
            lead_id,
            cancelled.rows_affected()
        );
        self.emit_state(lead_id, RoutingState::Withdrawn);
        Ok(updated)
    }

    /// Operator re-injection of an exhausted lead: back into routing at the
    /// exclusive phase with whatever candidates remain untried.
    pub async fn requeue_lead(&self, lead_id: Uuid) -> Result<Lead, AppError> {
        let lead = sqlx::query_as::<_, Lead>(
            "UPDATE leads SET routing_state = 'routing', exhausted_reason = NULL, \
             current_phase = NULL, phase_deadline = NULL, routed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND routing_state = 'exhausted' RETURNING *",
        )
        .bind(lead_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            AppError::BadRequest(format!(
                "Lead {} is not exhausted; only exhausted leads can be re-injected",
                lead_id
            ))
        })?;

        tracing::info!("Lead {} re-injected by operator", lead_id);
        self.emit_state(lead_id, RoutingState::Routing);
        self.scheduler()
            .enter_phase(&lead, crate::models::LeadPhase::Exclusive, None)
            .await?;

        let lead = sqlx::query_as::<_, Lead>("SELECT * FROM leads WHERE id = $1")
            .bind(lead_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(lead)
    }

    /// CRM status query: the lead plus its full offer history.
    pub async fn get_status(&self, lead_id: Uuid) -> Result<LeadStatusResponse, AppError> {
        let lead = sqlx::query_as::<_, Lead>("SELECT * FROM leads WHERE id = $1")
            .bind(lead_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", lead_id)))?;

        let assignments = sqlx::query_as::<_, LeadAssignment>(
            "SELECT * FROM lead_assignments WHERE lead_id = $1 \
             ORDER BY created_at ASC, priority ASC",
        )
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(LeadStatusResponse {
            lead,
            assignments: assignments.iter().map(AssignmentView::from).collect(),
        })
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_emails_pass() {
        assert!(is_valid_email("planner@example.com"));
        assert!(is_valid_email("first.last+tag@example.co.uk"));
    }

    #[test]
    fn fake_and_malformed_emails_fail() {
        assert!(!is_valid_email("no-at-sign.example.com"));
        assert!(!is_valid_email("user@nodot"));
        assert!(!is_valid_email("fake999999@example.com"));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn us_phones_normalize_to_e164() {
        let (valid, normalized) = validate_us_phone("(512) 555-0123");
        assert!(valid);
        assert_eq!(normalized, "+15125550123");

        let (valid, normalized) = validate_us_phone("512-555-0123");
        assert!(valid);
        assert_eq!(normalized, "+15125550123");

        let (valid, _) = validate_us_phone("12345");
        assert!(!valid);

        let (valid, _) = validate_us_phone("");
        assert!(!valid);
    }
}
