//! Per-performer reliability and performance counters.
//!
//! Lifetime counters only ever increase. Window rates are recomputed from
//! assignment history after every outcome rather than incrementally patched,
//! so a bug in one update can never leave them permanently skewed. All
//! updates for a single performer serialize on a row lock.

use chrono::{Datelike, Duration, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::config::RoutingConfig;
use crate::errors::AppError;
use crate::models::{Outcome, PerformerRoutingMetrics};
use crate::scoring::decayed_penalty;

/// Terminal-assignment counts over the rolling window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowCounts {
    pub accepted: i64,
    pub declined: i64,
    pub ignored: i64,
    pub expired: i64,
    /// Accepted assignments whose lead later converted.
    pub converted: i64,
}

/// Derived rates over the rolling window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowRates {
    pub acceptance_rate: f64,
    pub decline_rate: f64,
    pub ignore_rate: f64,
    /// Conversions per acceptance; accepted-then-never-converted leads drag
    /// this down.
    pub conversion_rate: f64,
    /// Share of offers that got any timely response (accept or decline).
    pub reliability: f64,
}

/// Compute window rates from counts. Pure; a performer with no history gets
/// zero rates and a neutral 0.5 reliability.
pub fn window_rates(c: &WindowCounts) -> WindowRates {
    let total = (c.accepted + c.declined + c.ignored + c.expired) as f64;
    if total == 0.0 {
        return WindowRates {
            acceptance_rate: 0.0,
            decline_rate: 0.0,
            ignore_rate: 0.0,
            conversion_rate: 0.0,
            reliability: 0.5,
        };
    }
    let conversion_rate = if c.accepted > 0 {
        (c.converted as f64 / c.accepted as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    WindowRates {
        acceptance_rate: c.accepted as f64 / total,
        decline_rate: c.declined as f64 / total,
        ignore_rate: c.ignored as f64 / total,
        conversion_rate,
        reliability: (c.accepted + c.declined) as f64 / total,
    }
}

/// Escalate the ignore penalty: decayed current value plus the configured
/// increment, capped at 1.0.
pub fn escalate_penalty(current_decayed: f64, increment: f64) -> f64 {
    (current_decayed + increment).clamp(0.0, 1.0)
}

/// Metrics store over the `performer_routing_metrics` table.
pub struct MetricsStore {
    pool: PgPool,
    config: RoutingConfig,
}

impl MetricsStore {
    pub fn new(pool: PgPool, config: RoutingConfig) -> Self {
        Self { pool, config }
    }

    /// Fetch a performer's metrics row.
    pub async fn get(
        &self,
        performer_id: Uuid,
    ) -> Result<Option<PerformerRoutingMetrics>, AppError> {
        let row = sqlx::query_as::<_, PerformerRoutingMetrics>(
            "SELECT * FROM performer_routing_metrics WHERE performer_id = $1",
        )
        .bind(performer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Record an assignment outcome for a performer and recompute their
    /// rolling rates.
    ///
    /// Atomic per performer: the metrics row is locked for the duration of
    /// the update, so outcomes for different leads landing simultaneously
    /// cannot lose increments.
    pub async fn record_outcome(
        &self,
        performer_id: Uuid,
        outcome: Outcome,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let metrics = Self::lock_row(&mut tx, performer_id).await?;
        let now = Utc::now();

        // Lifetime counters are monotonic; each outcome bumps exactly one.
        let (counter_sql, consecutive_ignores) = match outcome {
            Outcome::Accepted => ("accepted_count = accepted_count + 1", 0),
            Outcome::Declined => ("declined_count = declined_count + 1", 0),
            Outcome::Ignored => (
                "ignored_count = ignored_count + 1",
                metrics.consecutive_ignores + 1,
            ),
            Outcome::Expired => (
                "expired_count = expired_count + 1",
                metrics.consecutive_ignores,
            ),
            Outcome::Converted => ("converted_count = converted_count + 1", 0),
            Outcome::LeadLost => (
                "lost_count = lost_count + 1",
                metrics.consecutive_ignores,
            ),
        };

        let mut penalty = metrics.recent_lead_penalty;
        let mut penalty_applied_at = metrics.last_penalty_applied_at;
        let mut suspended = metrics.is_suspended;
        let mut suspension_reason = metrics.suspension_reason.clone();

        if outcome == Outcome::Ignored {
            let current = decayed_penalty(
                metrics.recent_lead_penalty,
                metrics.last_penalty_applied_at,
                self.config.penalty_decay_rate,
                now,
            );
            penalty = escalate_penalty(current, self.config.ignore_penalty_increment);
            penalty_applied_at = Some(now);

            if consecutive_ignores >= self.config.ignore_suspension_threshold && !suspended {
                suspended = true;
                suspension_reason = Some("excessive_ignores".to_string());
                tracing::warn!(
                    "Performer {} suspended after {} consecutive ignored leads",
                    performer_id,
                    consecutive_ignores
                );
            }
        }

        let query = format!(
            "UPDATE performer_routing_metrics SET {}, consecutive_ignores = $2, \
             recent_lead_penalty = $3, last_penalty_applied_at = $4, is_suspended = $5, \
             suspension_reason = $6, updated_at = $7 WHERE performer_id = $1",
            counter_sql
        );
        sqlx::query(&query)
            .bind(performer_id)
            .bind(consecutive_ignores)
            .bind(penalty)
            .bind(penalty_applied_at)
            .bind(suspended)
            .bind(&suspension_reason)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        Self::recompute_window_rates(&mut tx, performer_id, self.config.metrics_window_days)
            .await?;

        tx.commit().await?;

        tracing::info!(
            "Recorded outcome {:?} for performer {} (consecutive ignores: {})",
            outcome,
            performer_id,
            consecutive_ignores
        );
        Ok(())
    }

    /// Stamp a performer as routed: bumps the monthly counter (with calendar
    /// rollover) and the fairness timestamp. Called once per dispatched
    /// assignment.
    pub async fn record_routed(&self, performer_id: Uuid) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        let metrics = Self::lock_row(&mut tx, performer_id).await?;

        let now = Utc::now();
        let current_anchor = month_anchor(now.date_naive());
        let leads_this_month = if metrics.month_anchor == current_anchor {
            metrics.leads_this_month + 1
        } else {
            1
        };

        sqlx::query(
            "UPDATE performer_routing_metrics SET leads_this_month = $2, month_anchor = $3, \
             last_routed_at = $4, updated_at = $4 WHERE performer_id = $1",
        )
        .bind(performer_id)
        .bind(leads_this_month)
        .bind(current_anchor)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Operator override of the suspension flag, optionally stamping a
    /// time-boxed cooldown. Clearing a suspension also resets the
    /// consecutive-ignore run, otherwise the next ignored lead would
    /// immediately re-trip the threshold.
    pub async fn set_suspension(
        &self,
        performer_id: Uuid,
        suspended: bool,
        reason: Option<String>,
        cooldown_until: Option<chrono::DateTime<Utc>>,
    ) -> Result<PerformerRoutingMetrics, AppError> {
        let mut tx = self.pool.begin().await?;
        Self::lock_row(&mut tx, performer_id).await?;

        let updated = sqlx::query_as::<_, PerformerRoutingMetrics>(
            "UPDATE performer_routing_metrics SET is_suspended = $2, suspension_reason = $3, \
             cooldown_until = $4, \
             consecutive_ignores = CASE WHEN $2 THEN consecutive_ignores ELSE 0 END, \
             updated_at = NOW() WHERE performer_id = $1 RETURNING *",
        )
        .bind(performer_id)
        .bind(suspended)
        .bind(&reason)
        .bind(cooldown_until)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            "Suspension override for performer {}: suspended={} reason={:?}",
            performer_id,
            suspended,
            reason
        );
        Ok(updated)
    }

    /// Lock (and lazily create) the metrics row for update.
    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        performer_id: Uuid,
    ) -> Result<PerformerRoutingMetrics, AppError> {
        sqlx::query(
            "INSERT INTO performer_routing_metrics (performer_id, month_anchor) \
             VALUES ($1, date_trunc('month', NOW())::date) ON CONFLICT (performer_id) DO NOTHING",
        )
        .bind(performer_id)
        .execute(&mut **tx)
        .await?;

        let metrics = sqlx::query_as::<_, PerformerRoutingMetrics>(
            "SELECT * FROM performer_routing_metrics WHERE performer_id = $1 FOR UPDATE",
        )
        .bind(performer_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(metrics)
    }

    /// Recompute window rates and average response latency from assignment
    /// history. Runs inside the caller's transaction while the metrics row
    /// is still locked.
    async fn recompute_window_rates(
        tx: &mut Transaction<'_, Postgres>,
        performer_id: Uuid,
        window_days: i64,
    ) -> Result<(), AppError> {
        let window_start = Utc::now() - Duration::days(window_days);

        let counts: (i64, i64, i64, i64, i64) = sqlx::query_as(
            "SELECT \
               COUNT(*) FILTER (WHERE a.response_status = 'accepted'), \
               COUNT(*) FILTER (WHERE a.response_status = 'declined'), \
               COUNT(*) FILTER (WHERE a.response_status = 'ignored'), \
               COUNT(*) FILTER (WHERE a.response_status = 'expired'), \
               COUNT(*) FILTER (WHERE a.response_status = 'accepted' \
                 AND l.routing_state = 'converted' AND l.assigned_performer_id = a.performer_id) \
             FROM lead_assignments a \
             JOIN leads l ON l.id = a.lead_id \
             WHERE a.performer_id = $1 \
               AND a.response_status <> 'pending' \
               AND a.phase_started_at >= $2",
        )
        .bind(performer_id)
        .bind(window_start)
        .fetch_one(&mut **tx)
        .await?;

        let window = WindowCounts {
            accepted: counts.0,
            declined: counts.1,
            ignored: counts.2,
            expired: counts.3,
            converted: counts.4,
        };
        let rates = window_rates(&window);

        let avg_latency: (Option<f64>,) = sqlx::query_as(
            "SELECT AVG(response_latency_secs) FROM lead_assignments \
             WHERE performer_id = $1 AND responded_at >= $2 AND response_latency_secs IS NOT NULL",
        )
        .bind(performer_id)
        .bind(window_start)
        .fetch_one(&mut **tx)
        .await?;

        sqlx::query(
            "UPDATE performer_routing_metrics SET acceptance_rate = $2, decline_rate = $3, \
             ignore_rate = $4, conversion_rate = $5, reliability_score = $6, \
             avg_response_secs = $7 WHERE performer_id = $1",
        )
        .bind(performer_id)
        .bind(rates.acceptance_rate)
        .bind(rates.decline_rate)
        .bind(rates.ignore_rate)
        .bind(rates.conversion_rate)
        .bind(rates.reliability)
        .bind(avg_latency.0)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

/// First day of the month containing `date`.
fn month_anchor(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_is_neutral() {
        let rates = window_rates(&WindowCounts::default());
        assert_eq!(rates.acceptance_rate, 0.0);
        assert_eq!(rates.conversion_rate, 0.0);
        assert_eq!(rates.reliability, 0.5);
    }

    #[test]
    fn rates_partition_the_window() {
        let rates = window_rates(&WindowCounts {
            accepted: 5,
            declined: 3,
            ignored: 1,
            expired: 1,
            converted: 2,
        });
        assert!((rates.acceptance_rate - 0.5).abs() < 1e-12);
        assert!((rates.decline_rate - 0.3).abs() < 1e-12);
        assert!((rates.ignore_rate - 0.1).abs() < 1e-12);
        let sum = rates.acceptance_rate + rates.decline_rate + rates.ignore_rate + 0.1;
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn conversion_rate_degrades_without_bookings() {
        // Five acceptances, one conversion: accepted-then-never-converted
        // leads pull the rate down.
        let rates = window_rates(&WindowCounts {
            accepted: 5,
            converted: 1,
            ..Default::default()
        });
        assert!((rates.conversion_rate - 0.2).abs() < 1e-12);
    }

    #[test]
    fn reliability_counts_any_timely_response() {
        let rates = window_rates(&WindowCounts {
            accepted: 2,
            declined: 2,
            ignored: 4,
            expired: 2,
            converted: 0,
        });
        assert!((rates.reliability - 0.4).abs() < 1e-12);
    }

    #[test]
    fn penalty_escalation_caps_at_one() {
        assert!((escalate_penalty(0.3, 0.15) - 0.45).abs() < 1e-12);
        assert_eq!(escalate_penalty(0.95, 0.15), 1.0);
    }

    #[test]
    fn month_anchor_truncates() {
        assert_eq!(
            month_anchor(NaiveDate::from_ymd_opt(2025, 6, 15).unwrap()),
            NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
        );
    }
}
