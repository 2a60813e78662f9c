//! Candidate selection: who is eligible for a lead, and in what order.
//!
//! Eligibility filtering happens in SQL over published profiles; ranking is
//! a pure function over metric snapshots so it can be tested without a
//! database. An empty candidate list is a valid terminal condition for the
//! caller, not an error.

use bigdecimal::ToPrimitive;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::RoutingConfig;
use crate::errors::AppError;
use crate::models::{Lead, PerformerRoutingMetrics, ScoreBreakdown};
use crate::scoring::{response_speed_percentiles, routing_score, ScoreWeights};

/// One eligible performer with their score at selection time.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub performer_id: Uuid,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    pub last_routed_at: Option<DateTime<Utc>>,
}

/// Scoring inputs for one candidate: the profile's price range plus the
/// metrics snapshot.
#[derive(Debug, Clone)]
pub struct CandidateInput {
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub metrics: PerformerRoutingMetrics,
}

/// Rank candidates for a lead: score descending, ties broken by
/// `last_routed_at` ascending (never-routed performers first) so lead flow
/// stays fair among equals. Ineligible performers (suspended, cooling down)
/// score negative infinity and are dropped entirely.
pub fn rank_candidates(
    lead_budget_midpoint: Option<f64>,
    candidates: &[CandidateInput],
    weights: &ScoreWeights,
    penalty_decay_rate: f64,
    now: DateTime<Utc>,
) -> Vec<ScoredCandidate> {
    let metrics_set: Vec<PerformerRoutingMetrics> =
        candidates.iter().map(|c| c.metrics.clone()).collect();
    let speed_percentiles = response_speed_percentiles(&metrics_set);

    let mut scored: Vec<ScoredCandidate> = candidates
        .iter()
        .map(|c| {
            let pct = speed_percentiles
                .get(&c.metrics.performer_id)
                .copied()
                .unwrap_or(0.5);
            let (score, breakdown) = routing_score(
                &c.metrics,
                lead_budget_midpoint,
                c.price_min,
                c.price_max,
                pct,
                weights,
                penalty_decay_rate,
                now,
            );
            ScoredCandidate {
                performer_id: c.metrics.performer_id,
                score,
                breakdown,
                last_routed_at: c.metrics.last_routed_at,
            }
        })
        .filter(|c| c.score.is_finite())
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| match (a.last_routed_at, b.last_routed_at) {
                (None, None) => std::cmp::Ordering::Equal,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(x), Some(y)) => x.cmp(&y),
            })
            .then_with(|| a.performer_id.cmp(&b.performer_id))
    });
    scored
}

#[derive(Debug, sqlx::FromRow)]
struct EligibleProfileRow {
    id: Uuid,
    price_min: Option<bigdecimal::BigDecimal>,
    price_max: Option<bigdecimal::BigDecimal>,
    max_leads_per_month: Option<i32>,
}

/// Candidate selector over published performer profiles.
pub struct CandidateSelector {
    pool: PgPool,
    config: RoutingConfig,
}

impl CandidateSelector {
    pub fn new(pool: PgPool, config: RoutingConfig) -> Self {
        Self { pool, config }
    }

    /// Select and rank eligible performers for a lead.
    ///
    /// Filters on profile flags, accepted event types, service area and the
    /// monthly cap, and excludes performers who already hold an assignment
    /// on this lead (any status), so each phase only reaches new candidates.
    pub async fn select_candidates(&self, lead: &Lead) -> Result<Vec<ScoredCandidate>, AppError> {
        let profiles = sqlx::query_as::<_, EligibleProfileRow>(
            "SELECT p.id, p.price_min, p.price_max, p.max_leads_per_month \
             FROM performer_profiles p \
             WHERE p.is_active \
               AND p.accepts_leads \
               AND $1 = ANY(p.event_types) \
               AND (p.city = $2 \
                    OR $2 = ANY(p.service_cities) \
                    OR ($3::text IS NOT NULL AND $3 = ANY(p.service_states))) \
               AND NOT EXISTS (SELECT 1 FROM lead_assignments a \
                               WHERE a.lead_id = $4 AND a.performer_id = p.id)",
        )
        .bind(&lead.event_type)
        .bind(&lead.city)
        .bind(&lead.state)
        .bind(lead.id)
        .fetch_all(&self.pool)
        .await?;

        if profiles.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = profiles.iter().map(|p| p.id).collect();
        let metric_rows = sqlx::query_as::<_, PerformerRoutingMetrics>(
            "SELECT * FROM performer_routing_metrics WHERE performer_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let now = Utc::now();
        let current_anchor = current_month_anchor(now.date_naive());

        let candidates: Vec<CandidateInput> = profiles
            .into_iter()
            .filter_map(|p| {
                let metrics = metric_rows
                    .iter()
                    .find(|m| m.performer_id == p.id)
                    .cloned()
                    .unwrap_or_else(|| PerformerRoutingMetrics::fresh(p.id, current_anchor));

                // Monthly cap: a stale month anchor means the counter has
                // rolled over and the performer is back under cap.
                if let Some(cap) = p.max_leads_per_month {
                    let this_month = if metrics.month_anchor == current_anchor {
                        metrics.leads_this_month
                    } else {
                        0
                    };
                    if this_month >= cap {
                        tracing::debug!(
                            "Performer {} over monthly cap ({}/{}), skipping",
                            p.id,
                            this_month,
                            cap
                        );
                        return None;
                    }
                }

                Some(CandidateInput {
                    price_min: p.price_min.as_ref().and_then(|v| v.to_f64()),
                    price_max: p.price_max.as_ref().and_then(|v| v.to_f64()),
                    metrics,
                })
            })
            .collect();

        let midpoint = lead.budget_midpoint.as_ref().and_then(|v| v.to_f64());
        let ranked = rank_candidates(
            midpoint,
            &candidates,
            &self.config.weights,
            self.config.penalty_decay_rate,
            now,
        );

        tracing::info!(
            "Selected {} eligible candidate(s) for lead {} ({} profile matches before cap/eligibility)",
            ranked.len(),
            lead.id,
            candidates.len()
        );
        Ok(ranked)
    }
}

fn current_month_anchor(today: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn fresh(id: Uuid) -> PerformerRoutingMetrics {
        PerformerRoutingMetrics::fresh(id, NaiveDate::from_ymd_opt(2025, 6, 1).unwrap())
    }

    #[test]
    fn ranks_by_score_descending() {
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        let strong_id = Uuid::new_v4();
        let weak_id = Uuid::new_v4();

        let mut strong = fresh(strong_id);
        strong.reliability_score = 0.9;
        strong.acceptance_rate = 0.8;
        let weak = fresh(weak_id);

        let ranked = rank_candidates(
            Some(2000.0),
            &[
                CandidateInput {
                    price_min: Some(1500.0),
                    price_max: Some(2500.0),
                    metrics: weak,
                },
                CandidateInput {
                    price_min: Some(1500.0),
                    price_max: Some(2500.0),
                    metrics: strong,
                },
            ],
            &ScoreWeights::default(),
            0.094,
            now,
        );
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].performer_id, strong_id);
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn suspended_candidate_dropped_even_when_alone() {
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        let mut only = fresh(Uuid::new_v4());
        only.is_suspended = true;
        only.reliability_score = 1.0;

        let ranked = rank_candidates(
            Some(2000.0),
            &[CandidateInput {
                price_min: Some(1500.0),
                price_max: Some(2500.0),
                metrics: only,
            }],
            &ScoreWeights::default(),
            0.094,
            now,
        );
        assert!(ranked.is_empty());
    }

    #[test]
    fn equal_scores_tie_break_on_least_recently_routed() {
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        let recent_id = Uuid::new_v4();
        let stale_id = Uuid::new_v4();
        let never_id = Uuid::new_v4();

        let mut recent = fresh(recent_id);
        recent.last_routed_at = Some(now - Duration::hours(1));
        let mut stale = fresh(stale_id);
        stale.last_routed_at = Some(now - Duration::days(10));
        let never = fresh(never_id);

        let input = |m: PerformerRoutingMetrics| CandidateInput {
            price_min: Some(1000.0),
            price_max: Some(2000.0),
            metrics: m,
        };
        let ranked = rank_candidates(
            Some(1500.0),
            &[input(recent), input(stale), input(never)],
            &ScoreWeights::default(),
            0.094,
            now,
        );
        assert_eq!(ranked[0].performer_id, never_id);
        assert_eq!(ranked[1].performer_id, stale_id);
        assert_eq!(ranked[2].performer_id, recent_id);
    }

    #[test]
    fn budget_fit_outranks_raw_reliability() {
        // Austin wedding at a $2,000 midpoint: performer A prices
        // $1,500-$2,500 with reliability 0.9; performer B prices $500-$1,000
        // with reliability 0.95. A must rank first on budget fit.
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        let a_id = Uuid::new_v4();
        let b_id = Uuid::new_v4();

        let mut a = fresh(a_id);
        a.reliability_score = 0.9;
        let mut b = fresh(b_id);
        b.reliability_score = 0.95;

        let ranked = rank_candidates(
            Some(2000.0),
            &[
                CandidateInput {
                    price_min: Some(500.0),
                    price_max: Some(1000.0),
                    metrics: b,
                },
                CandidateInput {
                    price_min: Some(1500.0),
                    price_max: Some(2500.0),
                    metrics: a,
                },
            ],
            &ScoreWeights::default(),
            0.094,
            now,
        );
        assert_eq!(ranked[0].performer_id, a_id);
    }
}
