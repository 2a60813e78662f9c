//! Outbound collaborator clients: performer notifications and CRM routing
//! events.
//!
//! Both edges are fire-and-forget from the engine's perspective: delivery
//! failure is recoverable (the collaborator retries on its side) and never
//! affects phase timing or routing correctness. A circuit breaker keeps a
//! dead sink from piling up slow requests.

use bigdecimal::ToPrimitive;
use chrono::{DateTime, NaiveDate, Utc};
use failsafe::futures::CircuitBreaker;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::circuit_breaker::{create_notify_circuit_breaker, NotifyCircuitBreaker};
use crate::config::Config;
use crate::errors::AppError;
use crate::models::{Lead, RoutingState};

/// Compact lead description included in performer notifications. No planner
/// contact details: those are only released after acceptance, by the CRM
/// collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadSummary {
    pub lead_id: Uuid,
    pub event_type: String,
    pub event_date: Option<NaiveDate>,
    pub city: String,
    pub state: Option<String>,
    pub guest_count: Option<i32>,
    pub budget_midpoint: Option<f64>,
    pub lead_score: i32,
    pub is_last_minute: bool,
}

impl LeadSummary {
    pub fn from_lead(lead: &Lead) -> Self {
        Self {
            lead_id: lead.id,
            event_type: lead.event_type.clone(),
            event_date: lead.event_date,
            city: lead.city.clone(),
            state: lead.state.clone(),
            guest_count: lead.guest_count,
            budget_midpoint: lead.budget_midpoint.as_ref().and_then(|v| v.to_f64()),
            lead_score: lead.lead_score,
            is_last_minute: lead.is_last_minute,
        }
    }
}

/// Payload for the notification collaborator (email/SMS/voice fan-out).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformerNotification {
    pub performer_id: Uuid,
    pub assignment_id: Uuid,
    pub lead: LeadSummary,
    pub expires_at: DateTime<Utc>,
    /// Unique token for the response link in the outbound message.
    pub response_token: String,
}

/// Payload for a multi-performer inquiry notification. No offer window or
/// response token: multi-inquiries are direct planner outreach, not phased
/// offers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiInquiryNotification {
    pub performer_id: Uuid,
    pub inquiry_id: Uuid,
    pub event_type: String,
    pub event_date: Option<NaiveDate>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub guest_count: Option<i32>,
    pub budget: Option<f64>,
    pub lead_score: i32,
}

/// Event payload for CRM/dashboard collaborators to refresh their views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingStateEvent {
    pub lead_id: Uuid,
    pub new_state: RoutingState,
}

/// HTTP client for the outbound collaborator edges. Base URLs are optional;
/// when unset the calls degrade to log lines so the engine runs standalone.
pub struct NotificationService {
    client: Client,
    notify_base_url: Option<String>,
    events_base_url: Option<String>,
    breaker: NotifyCircuitBreaker,
}

impl NotificationService {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                AppError::InternalError(format!("Failed to build notification client: {}", e))
            })?;
        Ok(Self {
            client,
            notify_base_url: config.notify_base_url.clone(),
            events_base_url: config.events_base_url.clone(),
            breaker: create_notify_circuit_breaker(),
        })
    }

    /// Ask the notification collaborator to contact a performer about an
    /// offer. Returns an error on delivery failure so the caller can log it;
    /// callers must never roll back the assignment or its timer over this.
    pub async fn notify_performer(
        &self,
        notification: &PerformerNotification,
    ) -> Result<(), AppError> {
        let Some(ref base) = self.notify_base_url else {
            tracing::info!(
                "NOTIFY_BASE_URL unset; skipping notification for assignment {} (performer {})",
                notification.assignment_id,
                notification.performer_id
            );
            return Ok(());
        };

        let url = format!("{}/notify", base);
        self.post_guarded(&url, notification, "Notification").await?;

        tracing::info!(
            "Notified performer {} of assignment {} (expires {})",
            notification.performer_id,
            notification.assignment_id,
            notification.expires_at
        );
        Ok(())
    }

    /// Ask the notification collaborator to contact a performer about a
    /// multi-performer inquiry.
    pub async fn notify_multi_inquiry(
        &self,
        notification: &MultiInquiryNotification,
    ) -> Result<(), AppError> {
        let Some(ref base) = self.notify_base_url else {
            tracing::info!(
                "NOTIFY_BASE_URL unset; skipping inquiry notification for performer {}",
                notification.performer_id
            );
            return Ok(());
        };

        let url = format!("{}/notify-inquiry", base);
        self.post_guarded(&url, notification, "Inquiry notification")
            .await
    }

    /// Publish a routing-state change for CRM/dashboard consumers.
    pub async fn emit_state_changed(
        &self,
        lead_id: Uuid,
        new_state: RoutingState,
    ) -> Result<(), AppError> {
        let Some(ref base) = self.events_base_url else {
            tracing::debug!(
                "EVENTS_BASE_URL unset; routing state change {} -> {:?} logged only",
                lead_id,
                new_state
            );
            return Ok(());
        };

        let url = format!("{}/routing-events", base);
        let event = RoutingStateEvent { lead_id, new_state };
        self.post_guarded(&url, &event, "Routing event").await
    }

    /// POST a JSON payload through the circuit breaker. Transport errors and
    /// non-2xx statuses both count as breaker failures, so a sink returning
    /// 500s trips the circuit just like one that is unreachable.
    async fn post_guarded<T: Serialize>(
        &self,
        url: &str,
        payload: &T,
        what: &str,
    ) -> Result<(), AppError> {
        self.breaker
            .call(async {
                let response = self.client.post(url).json(payload).send().await?;
                response.error_for_status()?;
                Ok::<(), reqwest::Error>(())
            })
            .await
            .map_err(|e| match e {
                failsafe::Error::Inner(err) => {
                    AppError::ExternalApiError(format!("{} request failed: {}", what, err))
                }
                failsafe::Error::Rejected => AppError::ExternalApiError(format!(
                    "{} circuit open; send skipped",
                    what
                )),
            })
    }
}
