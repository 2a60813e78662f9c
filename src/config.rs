use serde::Deserialize;
use std::str::FromStr;

use crate::scoring::ScoreWeights;

/// Routing engine tunables.
///
/// Every window, cap and threshold from the routing design is configurable;
/// the defaults below are the shipped behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Exclusive-phase window for the single top candidate, in minutes.
    pub exclusive_window_minutes: i64,
    /// Broadcast-phase window, in minutes.
    pub broadcast_window_minutes: i64,
    /// Number of candidates offered simultaneously in the broadcast phase.
    pub broadcast_fan_out: usize,
    /// Open-phase window, in hours.
    pub open_window_hours: i64,
    /// Cap on candidates offered in the open phase.
    pub open_phase_cap: usize,
    /// Expiry-sweep interval, in seconds. Kept at or under one minute so
    /// stale offers are detected promptly.
    pub sweep_interval_secs: u64,
    /// Penalty added per ignored lead, capped at 1.0.
    pub ignore_penalty_increment: f64,
    /// Consecutive ignores before automatic suspension.
    pub ignore_suspension_threshold: i32,
    /// Fraction of the penalty removed per day. The default halves a penalty
    /// in roughly seven days.
    pub penalty_decay_rate: f64,
    /// Rolling window for rate computation, in days.
    pub metrics_window_days: i64,
    /// Scoring term weights.
    pub weights: ScoreWeights,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            exclusive_window_minutes: 30,
            broadcast_window_minutes: 240,
            broadcast_fan_out: 4,
            open_window_hours: 48,
            open_phase_cap: 20,
            sweep_interval_secs: 30,
            ignore_penalty_increment: 0.15,
            ignore_suspension_threshold: 5,
            penalty_decay_rate: 0.094,
            metrics_window_days: 90,
            weights: ScoreWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Base URL of the notification collaborator (email/SMS/voice fan-out).
    /// Optional: when unset, notifications are logged and skipped.
    pub notify_base_url: Option<String>,
    /// Base URL of the CRM/dashboard event sink for routing_state_changed.
    /// Optional: when unset, events are logged and skipped.
    pub events_base_url: Option<String>,
    /// Secret used to derive per-assignment response tokens.
    pub response_token_secret: String,
    pub routing: RoutingConfig,
}

/// Parse an optional environment variable with a default, failing loudly on
/// malformed values rather than silently falling back.
fn env_parse<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("{} must be a valid number, got '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

/// Validate an optional collaborator base URL.
fn env_base_url(name: &str) -> anyhow::Result<Option<String>> {
    match std::env::var(name).ok().filter(|s| !s.trim().is_empty()) {
        Some(raw) => {
            let parsed = url::Url::parse(&raw)
                .map_err(|e| anyhow::anyhow!("{} is not a valid URL: {}", name, e))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                anyhow::bail!("{} must start with http:// or https://", name);
            }
            Ok(Some(raw.trim_end_matches('/').to_string()))
        }
        None => Ok(None),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = RoutingConfig::default();

        let routing = RoutingConfig {
            exclusive_window_minutes: env_parse(
                "EXCLUSIVE_WINDOW_MINUTES",
                defaults.exclusive_window_minutes,
            )?,
            broadcast_window_minutes: env_parse(
                "BROADCAST_WINDOW_MINUTES",
                defaults.broadcast_window_minutes,
            )?,
            broadcast_fan_out: env_parse("BROADCAST_FAN_OUT", defaults.broadcast_fan_out)?,
            open_window_hours: env_parse("OPEN_WINDOW_HOURS", defaults.open_window_hours)?,
            open_phase_cap: env_parse("OPEN_PHASE_CAP", defaults.open_phase_cap)?,
            sweep_interval_secs: env_parse("SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs)?,
            ignore_penalty_increment: env_parse(
                "IGNORE_PENALTY_INCREMENT",
                defaults.ignore_penalty_increment,
            )?,
            ignore_suspension_threshold: env_parse(
                "IGNORE_SUSPENSION_THRESHOLD",
                defaults.ignore_suspension_threshold,
            )?,
            penalty_decay_rate: env_parse("PENALTY_DECAY_RATE", defaults.penalty_decay_rate)?,
            metrics_window_days: env_parse("METRICS_WINDOW_DAYS", defaults.metrics_window_days)?,
            weights: ScoreWeights {
                reliability: env_parse("WEIGHT_RELIABILITY", defaults.weights.reliability)?,
                acceptance: env_parse("WEIGHT_ACCEPTANCE", defaults.weights.acceptance)?,
                conversion: env_parse("WEIGHT_CONVERSION", defaults.weights.conversion)?,
                budget_fit: env_parse("WEIGHT_BUDGET_FIT", defaults.weights.budget_fit)?,
                response_speed: env_parse(
                    "WEIGHT_RESPONSE_SPEED",
                    defaults.weights.response_speed,
                )?,
            },
        };

        if routing.broadcast_fan_out == 0 {
            anyhow::bail!("BROADCAST_FAN_OUT must be at least 1");
        }
        if routing.sweep_interval_secs == 0 || routing.sweep_interval_secs > 60 {
            anyhow::bail!("SWEEP_INTERVAL_SECS must be between 1 and 60");
        }
        if !(0.0..=1.0).contains(&routing.penalty_decay_rate) {
            anyhow::bail!("PENALTY_DECAY_RATE must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&routing.ignore_penalty_increment) {
            anyhow::bail!("IGNORE_PENALTY_INCREMENT must be between 0.0 and 1.0");
        }
        if routing.ignore_suspension_threshold < 1 {
            anyhow::bail!("IGNORE_SUSPENSION_THRESHOLD must be at least 1");
        }

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            notify_base_url: env_base_url("NOTIFY_BASE_URL")?,
            events_base_url: env_base_url("EVENTS_BASE_URL")?,
            response_token_secret: std::env::var("RESPONSE_TOKEN_SECRET")
                .map_err(|_| {
                    anyhow::anyhow!("RESPONSE_TOKEN_SECRET environment variable required")
                })
                .and_then(|secret| {
                    if secret.trim().len() < 16 {
                        anyhow::bail!("RESPONSE_TOKEN_SECRET must be at least 16 characters");
                    }
                    Ok(secret)
                })?,
            routing,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        if let Some(ref notify) = config.notify_base_url {
            tracing::info!("Notification collaborator configured: {}", notify);
        } else {
            tracing::warn!("NOTIFY_BASE_URL unset; performer notifications will be logged only");
        }
        if let Some(ref events) = config.events_base_url {
            tracing::info!("Routing event sink configured: {}", events);
        }
        tracing::debug!("Server Port: {}", config.port);
        tracing::debug!(
            "Routing windows: exclusive {}m, broadcast {}m (fan-out {}), open {}h (cap {})",
            config.routing.exclusive_window_minutes,
            config.routing.broadcast_window_minutes,
            config.routing.broadcast_fan_out,
            config.routing.open_window_hours,
            config.routing.open_phase_cap,
        );

        Ok(config)
    }
}
