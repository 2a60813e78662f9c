//! Utility to inspect performer routing metrics and their recomputed scores.

use chrono::Utc;
use dj_routing_api::models::PerformerRoutingMetrics;
use dj_routing_api::scoring::{response_speed_percentiles, routing_score, ScoreWeights};
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::env;

/// Main entry point for the metrics inspection utility.
///
/// Connects to the database, lists every performer's counters, and prints the
/// routing score recomputed live from the stored snapshot.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new().connect(&database_url).await?;

    let metrics: Vec<PerformerRoutingMetrics> =
        sqlx::query_as("SELECT * FROM performer_routing_metrics ORDER BY performer_id")
            .fetch_all(&pool)
            .await?;

    if metrics.is_empty() {
        println!("No performer metrics recorded yet.");
        return Ok(());
    }

    let percentiles = response_speed_percentiles(&metrics);
    let weights = ScoreWeights::default();
    let now = Utc::now();

    println!("Found {} performer(s):", metrics.len());
    for m in &metrics {
        let pct = percentiles.get(&m.performer_id).copied().unwrap_or(0.5);
        let (score, breakdown) = routing_score(m, None, None, None, pct, &weights, 0.094, now);

        println!("- {}", m.performer_id);
        println!(
            "  accepted/declined/ignored/expired: {}/{}/{}/{}",
            m.accepted_count, m.declined_count, m.ignored_count, m.expired_count
        );
        println!(
            "  rates: acceptance {:.2} conversion {:.2} reliability {:.2}",
            m.acceptance_rate, m.conversion_rate, m.reliability_score
        );
        if m.is_suspended {
            println!(
                "  SUSPENDED ({})",
                m.suspension_reason.as_deref().unwrap_or("no reason recorded")
            );
        }
        if score.is_finite() {
            println!(
                "  score: {:.4} (raw {:.4}, penalty {:.4})",
                score, breakdown.raw_score, breakdown.penalty
            );
        } else {
            println!("  score: ineligible");
        }
        println!();
    }

    Ok(())
}
