//! Multi-performer inquiries: one planner inquiry fanned out to several
//! named performers simultaneously.
//!
//! Distinct from phased routing: there is no exclusivity ladder, no offer
//! window and no win resolution: the planner picked the performers and each
//! one simply gets contacted. The record tracks contacted/available/
//! unavailable counts and is read-only thereafter.

use bigdecimal::{BigDecimal, FromPrimitive};
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::lifecycle::{is_valid_email, validate_us_phone};
use crate::models::{MultiInquiryRequest, MultiInquiryResponse};
use crate::notifier::{MultiInquiryNotification, NotificationService};
use crate::scoring::{is_last_minute, lead_quality_score};

#[derive(Debug, sqlx::FromRow)]
struct TargetRow {
    id: Uuid,
    is_active: bool,
    accepts_leads: bool,
    is_suspended: Option<bool>,
}

pub struct MultiInquiryService {
    pool: PgPool,
    notifier: Arc<NotificationService>,
}

impl MultiInquiryService {
    pub fn new(pool: PgPool, notifier: Arc<NotificationService>) -> Self {
        Self { pool, notifier }
    }

    /// Create a multi-performer inquiry, notify every available target, and
    /// record the availability counts.
    pub async fn submit(
        &self,
        req: MultiInquiryRequest,
    ) -> Result<MultiInquiryResponse, AppError> {
        if req.planner_name.trim().is_empty() {
            return Err(AppError::BadRequest("planner_name is required".to_string()));
        }
        if !is_valid_email(req.planner_email.trim()) {
            return Err(AppError::BadRequest(format!(
                "planner_email '{}' is not a valid email address",
                req.planner_email
            )));
        }
        if req.event_type.trim().is_empty() {
            return Err(AppError::BadRequest("event_type is required".to_string()));
        }

        let mut performer_ids = req.performer_ids.clone();
        performer_ids.sort();
        performer_ids.dedup();
        if performer_ids.is_empty() {
            return Err(AppError::BadRequest(
                "performer_ids must name at least one performer".to_string(),
            ));
        }

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

        let targets = sqlx::query_as::<_, TargetRow>(
            "SELECT p.id, p.is_active, p.accepts_leads, m.is_suspended \
             FROM performer_profiles p \
             LEFT JOIN performer_routing_metrics m ON m.performer_id = p.id \
             WHERE p.id = ANY($1)",
        )
        .bind(&performer_ids)
        .fetch_all(&self.pool)
        .await?;

        if targets.is_empty() {
            return Err(AppError::NotFound(
                "None of the requested performers exist".to_string(),
            ));
        }

        let available: Vec<Uuid> = targets
            .iter()
            .filter(|t| t.is_active && t.accepts_leads && !t.is_suspended.unwrap_or(false))
            .map(|t| t.id)
            .collect();
        let contacted = targets.len() as i32;
        let unavailable = contacted - available.len() as i32;

        let today = Utc::now().date_naive();
        let score = lead_quality_score(
            req.budget,
            &req.event_type,
            req.event_date.is_some(),
            req.venue_name.is_some(),
            planner_phone.is_some(),
            req.guest_count,
            is_last_minute(req.event_date, today),
        );

        let inquiry_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO multi_inquiries \
               (id, planner_name, planner_email, planner_phone, event_type, event_date, city, \
                state, venue_name, guest_count, budget, special_requests, lead_score, \
                performers_contacted, performers_available, performers_unavailable, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, NOW())",
        )
        .bind(inquiry_id)
        .bind(req.planner_name.trim())
        .bind(req.planner_email.trim())
        .bind(&planner_phone)
        .bind(req.event_type.trim())
        .bind(req.event_date)
        .bind(&req.city)
        .bind(&req.state)
        .bind(&req.venue_name)
        .bind(req.guest_count)
        .bind(req.budget.and_then(BigDecimal::from_f64))
        .bind(&req.special_requests)
        .bind(score)
        .bind(contacted)
        .bind(available.len() as i32)
        .bind(unavailable)
        .execute(&self.pool)
        .await?;

        for performer_id in &available {
            let notification = MultiInquiryNotification {
                performer_id: *performer_id,
                inquiry_id,
                event_type: req.event_type.trim().to_string(),
                event_date: req.event_date,
                city: req.city.clone(),
                state: req.state.clone(),
                guest_count: req.guest_count,
                budget: req.budget,
                lead_score: score,
            };
            let notifier = Arc::clone(&self.notifier);
            tokio::spawn(async move {
                if let Err(e) = notifier.notify_multi_inquiry(&notification).await {
                    tracing::warn!(
                        "Inquiry notification for performer {} failed: {}",
                        notification.performer_id,
                        e
                    );
                }
            });
        }

        tracing::info!(
            "Multi-inquiry {} created: {} contacted, {} available, {} unavailable",
            inquiry_id,
            contacted,
            available.len(),
            unavailable
        );

        Ok(MultiInquiryResponse {
            id: inquiry_id,
            lead_score: score,
            performers_contacted: contacted,
            performers_available: available.len() as i32,
            performers_unavailable: unavailable,
        })
    }
}
