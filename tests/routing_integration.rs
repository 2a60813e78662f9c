//! Integration tests for the routing engine against a real Postgres.
//!
//! Marked ignored to avoid running against production by accident; set
//! TEST_DATABASE_URL to run. Each test creates its own leads and performers
//! under fresh UUIDs, so repeated runs do not interfere.

use std::env;
use std::sync::Arc;

use chrono::NaiveDate;
use dj_routing_api::config::{Config, RoutingConfig};
use dj_routing_api::db::Database;
use dj_routing_api::lifecycle::LeadLifecycleManager;
use dj_routing_api::metrics::MetricsStore;
use dj_routing_api::models::{
    Lead, LeadPhase, Outcome, ResponseAction, ResponseStatus, RoutingState, SubmitLeadRequest,
};
use dj_routing_api::notifier::NotificationService;
use dj_routing_api::outcomes::{OutcomeRecorder, ResponseResolution};
use dj_routing_api::scheduler::PhaseScheduler;
use dj_routing_api::selector::CandidateSelector;
use sqlx::PgPool;
use uuid::Uuid;

async fn test_setup() -> anyhow::Result<(Config, PgPool, Arc<NotificationService>)> {
    let db_url = env::var("TEST_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("Set TEST_DATABASE_URL or DATABASE_URL to run this test"))?;

    let config = Config {
        database_url: db_url.clone(),
        port: 0,
        notify_base_url: None,
        events_base_url: None,
        response_token_secret: "integration-test-secret".to_string(),
        routing: RoutingConfig::default(),
    };
    let db = Database::new(&db_url).await?;
    let notifier = Arc::new(NotificationService::new(&config).map_err(|e| anyhow::anyhow!(e.to_string()))?);
    Ok((config, db.pool, notifier))
}

async fn create_performer(
    pool: &PgPool,
    city: &str,
    state: &str,
    event_type: &str,
    price_min: f64,
    price_max: f64,
) -> anyhow::Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO performer_profiles \
           (id, display_name, city, state, service_states, service_cities, event_types, \
            price_min, price_max, accepts_leads, is_active, created_at) \
         VALUES ($1, $2, $3, $4, ARRAY[$4], ARRAY[$3], ARRAY[$5], $6, $7, TRUE, TRUE, NOW())",
    )
    .bind(id)
    .bind(format!("Performer {}", &id.to_string()[..8]))
    .bind(city)
    .bind(state)
    .bind(event_type)
    .bind(price_min)
    .bind(price_max)
    .execute(pool)
    .await?;
    Ok(id)
}

/// A unique city name isolates each test's candidate pool.
fn unique_city() -> String {
    format!("Testville-{}", &Uuid::new_v4().to_string()[..8])
}

fn lead_request(city: &str) -> SubmitLeadRequest {
    SubmitLeadRequest {
        event_type: "wedding".to_string(),
        event_date: NaiveDate::from_ymd_opt(2099, 9, 20),
        event_time: None,
        city: city.to_string(),
        state: Some("TX".to_string()),
        venue_name: Some("The Driskill".to_string()),
        guest_count: Some(150),
        budget_min: Some(1500.0),
        budget_max: Some(2500.0),
        planner_name: "Jordan Planner".to_string(),
        planner_email: "jordan.planner@example.com".to_string(),
        planner_phone: None,
        special_requests: None,
    }
}

async fn fetch_lead(pool: &PgPool, id: Uuid) -> anyhow::Result<Lead> {
    Ok(sqlx::query_as::<_, Lead>("SELECT * FROM leads WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await?)
}

#[tokio::test]
#[ignore]
async fn submit_and_accept_smoke_test() -> anyhow::Result<()> {
    let (config, pool, notifier) = test_setup().await?;
    let city = unique_city();
    let top = create_performer(&pool, &city, "TX", "wedding", 1500.0, 2500.0).await?;
    create_performer(&pool, &city, "TX", "wedding", 500.0, 1000.0).await?;

    let lifecycle = LeadLifecycleManager::new(pool.clone(), config.clone(), Arc::clone(&notifier));
    let lead = lifecycle.submit_lead(lead_request(&city)).await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    assert_eq!(lead.routing_state, RoutingState::Routing);
    assert_eq!(lead.current_phase, Some(LeadPhase::Exclusive));

    // Exactly one exclusive offer, to the budget-fitting performer.
    let assignments: Vec<(Uuid, Uuid)> = sqlx::query_as(
        "SELECT id, performer_id FROM lead_assignments WHERE lead_id = $1",
    )
    .bind(lead.id)
    .fetch_all(&pool)
    .await?;
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].1, top);

    let recorder = OutcomeRecorder::new(pool.clone(), config.clone(), Arc::clone(&notifier));
    let resolution = recorder
        .record_response(assignments[0].0, ResponseAction::Accept, None, None)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert_eq!(resolution, ResponseResolution::Won);

    let lead = fetch_lead(&pool, lead.id).await?;
    assert_eq!(lead.routing_state, RoutingState::Assigned);
    assert_eq!(lead.assigned_performer_id, Some(top));

    // Duplicate delivery is an idempotent no-op.
    let duplicate = recorder
        .record_response(assignments[0].0, ResponseAction::Accept, None, None)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert_eq!(duplicate, ResponseResolution::AlreadyResolved);

    let metrics = MetricsStore::new(pool.clone(), config.routing.clone());
    let m = metrics.get(top).await.map_err(|e| anyhow::anyhow!(e.to_string()))?.unwrap();
    assert_eq!(m.accepted_count, 1);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn broadcast_race_has_exactly_one_winner() -> anyhow::Result<()> {
    let (config, pool, notifier) = test_setup().await?;
    let city = unique_city();
    let a = create_performer(&pool, &city, "TX", "wedding", 1500.0, 2500.0).await?;
    let b = create_performer(&pool, &city, "TX", "wedding", 1500.0, 2500.0).await?;

    // Lead parked mid-broadcast with two outstanding offers.
    let lead_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO leads (id, event_type, city, state, planner_name, planner_email, \
         routing_state, current_phase, created_at) \
         VALUES ($1, 'wedding', $2, 'TX', 'Jordan', 'jordan@example.com', 'routing', \
                 'broadcast', NOW())",
    )
    .bind(lead_id)
    .bind(&city)
    .execute(&pool)
    .await?;

    let mut assignment_ids = Vec::new();
    for (priority, performer) in [a, b].iter().enumerate() {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO lead_assignments \
               (id, lead_id, performer_id, phase, priority, phase_started_at, phase_expires_at, \
                notified_at, response_status, routing_score_at_assignment, score_breakdown, \
                response_token, created_at) \
             VALUES ($1, $2, $3, 'broadcast', $4, NOW(), NOW() + INTERVAL '4 hours', NOW(), \
                     'pending', 0.5, '{}', $5, NOW())",
        )
        .bind(id)
        .bind(lead_id)
        .bind(performer)
        .bind(priority as i32)
        .bind(format!("token-{}", id))
        .execute(&pool)
        .await?;
        assignment_ids.push(id);
    }

    // Two acceptances race.
    let mut handles = Vec::new();
    for assignment_id in assignment_ids.clone() {
        let pool = pool.clone();
        let config = config.clone();
        let notifier = Arc::clone(&notifier);
        handles.push(tokio::spawn(async move {
            let recorder = OutcomeRecorder::new(pool, config, notifier);
            recorder
                .record_response(assignment_id, ResponseAction::Accept, None, None)
                .await
        }));
    }

    let mut resolutions = Vec::new();
    for handle in handles {
        resolutions.push(handle.await?.map_err(|e| anyhow::anyhow!(e.to_string()))?);
    }

    let winners = resolutions
        .iter()
        .filter(|r| **r == ResponseResolution::Won)
        .count();
    assert_eq!(winners, 1, "exactly one acceptance must win: {:?}", resolutions);

    let lead = fetch_lead(&pool, lead_id).await?;
    assert_eq!(lead.routing_state, RoutingState::Assigned);

    let statuses: Vec<(ResponseStatus,)> = sqlx::query_as(
        "SELECT response_status FROM lead_assignments WHERE lead_id = $1",
    )
    .bind(lead_id)
    .fetch_all(&pool)
    .await?;
    let accepted = statuses.iter().filter(|s| s.0 == ResponseStatus::Accepted).count();
    let expired = statuses.iter().filter(|s| s.0 == ResponseStatus::Expired).count();
    assert_eq!(accepted, 1);
    assert_eq!(expired, 1);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn exclusive_expiry_opens_broadcast() -> anyhow::Result<()> {
    let (config, pool, notifier) = test_setup().await?;
    let city = unique_city();
    create_performer(&pool, &city, "TX", "wedding", 1500.0, 2500.0).await?;
    create_performer(&pool, &city, "TX", "wedding", 1400.0, 2400.0).await?;
    create_performer(&pool, &city, "TX", "wedding", 1300.0, 2300.0).await?;

    let lifecycle = LeadLifecycleManager::new(pool.clone(), config.clone(), Arc::clone(&notifier));
    let lead = lifecycle.submit_lead(lead_request(&city)).await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert_eq!(lead.current_phase, Some(LeadPhase::Exclusive));

    // Backdate the exclusive window so the sweep sees it lapsed.
    sqlx::query(
        "UPDATE lead_assignments SET phase_expires_at = NOW() - INTERVAL '1 minute' \
         WHERE lead_id = $1",
    )
    .bind(lead.id)
    .execute(&pool)
    .await?;

    let scheduler = PhaseScheduler::new(pool.clone(), config.clone(), Arc::clone(&notifier));
    let closed = scheduler.run_expiry_sweep().await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert!(closed >= 1);

    // The lapsed exclusive offer is expired, not declined.
    let exclusive_status: (ResponseStatus,) = sqlx::query_as(
        "SELECT response_status FROM lead_assignments \
         WHERE lead_id = $1 AND phase = 'exclusive'",
    )
    .bind(lead.id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(exclusive_status.0, ResponseStatus::Expired);

    // Exactly one broadcast phase began with the next-ranked candidates.
    let lead = fetch_lead(&pool, lead.id).await?;
    assert_eq!(lead.routing_state, RoutingState::Routing);
    assert_eq!(lead.current_phase, Some(LeadPhase::Broadcast));

    let broadcast_count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM lead_assignments \
         WHERE lead_id = $1 AND phase = 'broadcast' AND response_status = 'pending'",
    )
    .bind(lead.id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(broadcast_count.0, 2);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn withdrawal_cancels_outstanding_offers() -> anyhow::Result<()> {
    let (config, pool, notifier) = test_setup().await?;
    let city = unique_city();
    for i in 0..3 {
        create_performer(&pool, &city, "TX", "wedding", 1000.0 + i as f64, 2000.0).await?;
    }

    let lifecycle = LeadLifecycleManager::new(pool.clone(), config.clone(), Arc::clone(&notifier));
    let lead = lifecycle.submit_lead(lead_request(&city)).await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let withdrawn = lifecycle.cancel_lead(lead.id).await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert_eq!(withdrawn.routing_state, RoutingState::Withdrawn);

    let outstanding: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM lead_assignments \
         WHERE lead_id = $1 AND response_status = 'pending'",
    )
    .bind(lead.id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(outstanding.0, 0);

    // Withdrawal is idempotent.
    let again = lifecycle.cancel_lead(lead.id).await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert_eq!(again.routing_state, RoutingState::Withdrawn);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn consecutive_ignores_suspend_and_exclude() -> anyhow::Result<()> {
    let (config, pool, notifier) = test_setup().await?;
    let city = unique_city();
    let performer = create_performer(&pool, &city, "TX", "wedding", 1500.0, 2500.0).await?;

    let metrics = MetricsStore::new(pool.clone(), config.routing.clone());
    for _ in 0..config.routing.ignore_suspension_threshold {
        metrics.record_outcome(performer, Outcome::Ignored).await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    }

    let m = metrics.get(performer).await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?.unwrap();
    assert!(m.is_suspended);
    assert_eq!(m.suspension_reason.as_deref(), Some("excessive_ignores"));

    // The 6th lead in their city must not reach them, even as the only match.
    let lifecycle = LeadLifecycleManager::new(pool.clone(), config.clone(), Arc::clone(&notifier));
    let lead = lifecycle.submit_lead(lead_request(&city)).await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert_eq!(lead.routing_state, RoutingState::Exhausted);

    let selector = CandidateSelector::new(pool.clone(), config.routing.clone());
    let candidates = selector.select_candidates(&lead).await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert!(candidates.is_empty());

    // Operator review clears the suspension and the ignore run.
    let cleared = metrics.set_suspension(performer, false, None, None).await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert!(!cleared.is_suspended);
    assert_eq!(cleared.consecutive_ignores, 0);
    Ok(())
}
