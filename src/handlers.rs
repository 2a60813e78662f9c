use crate::config::Config;
use crate::dispatcher::AssignmentDispatcher;
use crate::errors::AppError;
use crate::lifecycle::LeadLifecycleManager;
use crate::models::*;
use crate::multi_inquiry::MultiInquiryService;
use crate::notifier::NotificationService;
use crate::outcomes::{OutcomeRecorder, ResponseResolution};
use crate::scoring::{response_speed_percentiles, routing_score};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use bigdecimal::ToPrimitive;
use chrono::Utc;
use moka::future::Cache;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub db: PgPool,
    /// Application configuration.
    pub config: Config,
    /// Outbound collaborator clients (notifications, routing events).
    pub notifier: Arc<NotificationService>,
    /// Deduplication cache for performer-response deliveries: the same
    /// (assignment, action) seen within the TTL short-circuits to
    /// already-resolved without touching the database.
    pub response_dedupe_cache: Cache<String, i64>,
}

/// Health check endpoint.
///
/// Returns the service status, version, and health information.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "dj-routing-api",
            "version": "0.1.0"
        })),
    )
}

/// POST /api/v1/leads
///
/// Submit a new booking inquiry. Validation failures reject with 400 before
/// any routing state exists; a valid lead is persisted, scored and routed
/// immediately (possibly straight to exhausted when nobody is eligible).
pub async fn submit_lead(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitLeadRequest>,
) -> Result<(StatusCode, Json<Lead>), AppError> {
    tracing::info!(
        "POST /leads - {} in {} ({})",
        req.event_type,
        req.city,
        req.planner_email
    );

    let lifecycle = LeadLifecycleManager::new(
        state.db.clone(),
        state.config.clone(),
        Arc::clone(&state.notifier),
    );
    let lead = lifecycle.submit_lead(req).await?;

    Ok((StatusCode::CREATED, Json(lead)))
}

/// GET /api/v1/leads/:id
///
/// Lead status plus its full offer history, for CRM/dashboard views.
pub async fn get_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<LeadStatusResponse>, AppError> {
    let lifecycle = LeadLifecycleManager::new(
        state.db.clone(),
        state.config.clone(),
        Arc::clone(&state.notifier),
    );
    Ok(Json(lifecycle.get_status(id).await?))
}

/// POST /api/v1/leads/:id/cancel
///
/// Planner-initiated withdrawal. Idempotent for already-withdrawn leads.
pub async fn cancel_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Lead>, AppError> {
    tracing::info!("POST /leads/{}/cancel", id);

    let lifecycle = LeadLifecycleManager::new(
        state.db.clone(),
        state.config.clone(),
        Arc::clone(&state.notifier),
    );
    Ok(Json(lifecycle.cancel_lead(id).await?))
}

/// POST /api/v1/leads/:id/converted
///
/// Booking confirmation from the billing/CRM collaborator, attributed back
/// to the accepted assignment for conversion-rate scoring.
pub async fn mark_converted(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ConvertedRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    tracing::info!("POST /leads/{}/converted (performer {})", id, req.performer_id);

    let recorder = OutcomeRecorder::new(
        state.db.clone(),
        state.config.clone(),
        Arc::clone(&state.notifier),
    );
    recorder.mark_converted(id, req.performer_id).await?;

    Ok(Json(json!({ "status": "converted" })))
}

/// POST /api/v1/leads/:id/requeue
///
/// Operator re-injection of an exhausted lead.
pub async fn requeue_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Lead>, AppError> {
    tracing::info!("POST /leads/{}/requeue", id);

    let lifecycle = LeadLifecycleManager::new(
        state.db.clone(),
        state.config.clone(),
        Arc::clone(&state.notifier),
    );
    Ok(Json(lifecycle.requeue_lead(id).await?))
}

/// POST /api/v1/assignments/:id/response
///
/// Performer response from the notification-reply collaborator (SMS/email
/// click or dashboard button). Duplicate deliveries resolve as
/// `already_resolved`, never as an error the performer sees.
pub async fn submit_response(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<PerformerResponseRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    tracing::info!("POST /assignments/{}/response - {:?}", id, req.action);

    let dedupe_key = format!("{}:{:?}", id, req.action);
    if state.response_dedupe_cache.get(&dedupe_key).await.is_some() {
        tracing::debug!("Duplicate response delivery for {}; short-circuit", dedupe_key);
        return Ok(Json(
            json!({ "resolution": ResponseResolution::AlreadyResolved }),
        ));
    }

    let recorder = OutcomeRecorder::new(
        state.db.clone(),
        state.config.clone(),
        Arc::clone(&state.notifier),
    );
    let resolution = recorder
        .record_response(id, req.action, req.token.as_deref(), req.decline_reason)
        .await?;

    state
        .response_dedupe_cache
        .insert(dedupe_key, Utc::now().timestamp())
        .await;

    Ok(Json(json!({ "resolution": resolution })))
}

/// POST /api/v1/assignments/:id/viewed
///
/// Exposure stamp from the performer dashboard: the offer was opened. Feeds
/// the ignored-vs-expired distinction at window lapse.
pub async fn record_viewed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let dispatcher = AssignmentDispatcher::new(
        state.db.clone(),
        &state.config,
        Arc::clone(&state.notifier),
    );
    dispatcher.record_viewed(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/performers/:id/metrics
///
/// Operator view of a performer's counters with the routing score recomputed
/// live against a neutral lead.
pub async fn get_performer_metrics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<MetricsView>, AppError> {
    let metrics = sqlx::query_as::<_, PerformerRoutingMetrics>(
        "SELECT * FROM performer_routing_metrics WHERE performer_id = $1",
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("No routing metrics for performer {}", id)))?;

    let profile = sqlx::query_as::<_, PerformerProfile>(
        "SELECT * FROM performer_profiles WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await?;
    let (price_min, price_max) = profile
        .map(|p| (p.price_min, p.price_max))
        .unwrap_or((None, None));

    let peers = vec![metrics.clone()];
    let pct = response_speed_percentiles(&peers)
        .get(&id)
        .copied()
        .unwrap_or(0.5);
    let (score, breakdown) = routing_score(
        &metrics,
        None,
        price_min.as_ref().and_then(|v| v.to_f64()),
        price_max.as_ref().and_then(|v| v.to_f64()),
        pct,
        &state.config.routing.weights,
        state.config.routing.penalty_decay_rate,
        Utc::now(),
    );

    let (current_routing_score, breakdown) = if score.is_finite() {
        (Some(score), Some(breakdown))
    } else {
        (None, None)
    };

    Ok(Json(MetricsView {
        metrics,
        current_routing_score,
        breakdown,
    }))
}

/// POST /api/v1/performers/:id/suspension
///
/// Operator override: suspend or reinstate a performer. Suspension is never
/// automatic-permanent; this is the review path that clears it.
pub async fn override_suspension(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<SuspensionOverrideRequest>,
) -> Result<Json<PerformerRoutingMetrics>, AppError> {
    tracing::info!(
        "POST /performers/{}/suspension - suspended={}",
        id,
        req.suspended
    );

    let store = crate::metrics::MetricsStore::new(state.db.clone(), state.config.routing.clone());
    let updated = store
        .set_suspension(id, req.suspended, req.reason, req.cooldown_until)
        .await?;
    Ok(Json(updated))
}

/// GET /api/v1/leads/:id/distributions
///
/// Coarse per-performer audit trail for reporting: contacted/viewed/
/// accepted/declined stamps and decline reasons. Never consulted for
/// routing decisions.
pub async fn get_lead_distributions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<LeadDistribution>>, AppError> {
    let rows = sqlx::query_as::<_, LeadDistribution>(
        "SELECT * FROM lead_distributions WHERE lead_id = $1 ORDER BY created_at ASC",
    )
    .bind(id)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(rows))
}

/// GET /api/v1/multi-inquiry/:id
///
/// Read back a multi-performer inquiry and its availability counts.
pub async fn get_multi_inquiry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<MultiInquiry>, AppError> {
    let inquiry = sqlx::query_as::<_, MultiInquiry>(
        "SELECT * FROM multi_inquiries WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Multi-inquiry {} not found", id)))?;
    Ok(Json(inquiry))
}

/// POST /api/v1/multi-inquiry
///
/// Planner inquiry fanned out to several named performers simultaneously.
pub async fn submit_multi_inquiry(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MultiInquiryRequest>,
) -> Result<(StatusCode, Json<MultiInquiryResponse>), AppError> {
    tracing::info!(
        "POST /multi-inquiry - {} performer(s) for {} ({})",
        req.performer_ids.len(),
        req.event_type,
        req.planner_email
    );

    let service = MultiInquiryService::new(state.db.clone(), Arc::clone(&state.notifier));
    let response = service.submit(req).await?;
    Ok((StatusCode::CREATED, Json(response)))
}
