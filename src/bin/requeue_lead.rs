//! Utility to re-inject an exhausted lead into routing.
//!
//! Usage: requeue-lead <lead-uuid>

use dj_routing_api::config::Config;
use dj_routing_api::db::Database;
use dj_routing_api::lifecycle::LeadLifecycleManager;
use dj_routing_api::notifier::NotificationService;
use std::env;
use std::sync::Arc;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let lead_id: Uuid = env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("Usage: requeue-lead <lead-uuid>"))?
        .parse()
        .map_err(|_| anyhow::anyhow!("Argument must be a valid UUID"))?;

    let config = Config::from_env()?;
    let db = Database::new(&config.database_url).await?;
    let notifier = Arc::new(
        NotificationService::new(&config).map_err(|e| anyhow::anyhow!(e.to_string()))?,
    );

    let lifecycle = LeadLifecycleManager::new(db.pool.clone(), config, notifier);
    let lead = lifecycle
        .requeue_lead(lead_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    println!(
        "Lead {} re-injected: state {:?}, phase {:?}",
        lead.id, lead.routing_state, lead.current_phase
    );
    Ok(())
}
