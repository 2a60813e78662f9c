//! Pure scoring functions for the routing engine.
//!
//! Everything in this module is deterministic over its inputs: no I/O, no
//! clocks. Callers pass `now` explicitly so scores can be recomputed and
//! verified after the fact. Decayed values are computed on read from the
//! stored penalty + timestamp, never mutated in place.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{PerformerRoutingMetrics, ScoreBreakdown, SubmitLeadRequest};

/// Events this close to today are flagged last-minute.
pub const LAST_MINUTE_DAYS: i64 = 14;

/// Weights for the routing-score terms. Must sum to roughly 1.0 for the
/// score to stay in [0,1]; the defaults do.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ScoreWeights {
    pub reliability: f64,
    pub acceptance: f64,
    pub conversion: f64,
    pub budget_fit: f64,
    pub response_speed: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            reliability: 0.30,
            acceptance: 0.20,
            conversion: 0.20,
            budget_fit: 0.15,
            response_speed: 0.15,
        }
    }
}

/// Whether a performer may receive offers at all right now. Suspended or
/// cooling-down performers are excluded outright, never just down-ranked.
pub fn is_eligible_now(metrics: &PerformerRoutingMetrics, now: DateTime<Utc>) -> bool {
    if metrics.is_suspended {
        return false;
    }
    match metrics.cooldown_until {
        Some(until) => until <= now,
        None => true,
    }
}

/// Penalty remaining after exponential decay since it was last applied.
///
/// `rate_per_day` is the fraction removed per day; the stored value is
/// untouched and the decayed value recomputed on every read.
pub fn decayed_penalty(
    penalty: f64,
    last_applied_at: Option<DateTime<Utc>>,
    rate_per_day: f64,
    now: DateTime<Utc>,
) -> f64 {
    if penalty <= 0.0 {
        return 0.0;
    }
    let Some(applied_at) = last_applied_at else {
        return penalty.clamp(0.0, 1.0);
    };
    let elapsed_secs = (now - applied_at).num_seconds().max(0) as f64;
    let elapsed_days = elapsed_secs / 86_400.0;
    let decayed = penalty * (1.0 - rate_per_day).powf(elapsed_days);
    decayed.clamp(0.0, 1.0)
}

/// Triangular budget-fit between a lead's budget midpoint and a performer's
/// price range.
///
/// 1.0 when the midpoint falls inside the range, decaying linearly to 0 at
/// twice the range width outside either bound. Degenerate (zero-width)
/// ranges get a one-dollar floor width so a single-price listing still has a
/// finite falloff. When either side is unknown the fit is a neutral 0.5.
pub fn budget_fit(lead_midpoint: Option<f64>, price_min: Option<f64>, price_max: Option<f64>) -> f64 {
    let (Some(midpoint), Some(min), Some(max)) = (lead_midpoint, price_min, price_max) else {
        return 0.5;
    };
    let (min, max) = if min <= max { (min, max) } else { (max, min) };
    if midpoint >= min && midpoint <= max {
        return 1.0;
    }
    let width = (max - min).max(1.0);
    let distance = if midpoint < min {
        min - midpoint
    } else {
        midpoint - max
    };
    (1.0 - distance / (2.0 * width)).clamp(0.0, 1.0)
}

/// Response-speed percentile of each performer relative to the peer set,
/// where faster responders score higher.
///
/// Performers with no latency history sit at a neutral 0.5 rather than
/// being rewarded or punished for silence.
pub fn response_speed_percentiles(
    peers: &[PerformerRoutingMetrics],
) -> HashMap<Uuid, f64> {
    let mut timed: Vec<(Uuid, f64)> = peers
        .iter()
        .filter_map(|m| m.avg_response_secs.map(|s| (m.performer_id, s)))
        .collect();
    timed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut out = HashMap::with_capacity(peers.len());
    let n = timed.len();
    for (rank, (id, _)) in timed.iter().enumerate() {
        // Fastest gets 1.0; with a single timed peer the percentile is 1.0.
        let pct = if n == 1 {
            1.0
        } else {
            1.0 - rank as f64 / (n - 1) as f64
        };
        out.insert(*id, pct);
    }
    for m in peers {
        out.entry(m.performer_id).or_insert(0.5);
    }
    out
}

/// Compute a performer's routing score for a lead.
///
/// Returns the effective score and its term breakdown. Ineligible performers
/// (suspended or cooling down) score `f64::NEG_INFINITY` so they can never
/// be selected, even as the only match; their breakdown is zeroed.
pub fn routing_score(
    metrics: &PerformerRoutingMetrics,
    lead_budget_midpoint: Option<f64>,
    price_min: Option<f64>,
    price_max: Option<f64>,
    speed_percentile: f64,
    weights: &ScoreWeights,
    penalty_decay_rate: f64,
    now: DateTime<Utc>,
) -> (f64, ScoreBreakdown) {
    if !is_eligible_now(metrics, now) {
        return (f64::NEG_INFINITY, ScoreBreakdown::default());
    }

    let reliability = weights.reliability * metrics.reliability_score.clamp(0.0, 1.0);
    let acceptance = weights.acceptance * metrics.acceptance_rate.clamp(0.0, 1.0);
    let conversion = weights.conversion * metrics.conversion_rate.clamp(0.0, 1.0);
    let fit = weights.budget_fit * budget_fit(lead_budget_midpoint, price_min, price_max);
    let speed = weights.response_speed * speed_percentile.clamp(0.0, 1.0);

    let raw_score = reliability + acceptance + conversion + fit + speed;
    let penalty = decayed_penalty(
        metrics.recent_lead_penalty,
        metrics.last_penalty_applied_at,
        penalty_decay_rate,
        now,
    );
    let effective = (raw_score * (1.0 - penalty)).clamp(0.0, 1.0);

    (
        effective,
        ScoreBreakdown {
            reliability,
            acceptance,
            conversion,
            budget_fit: fit,
            response_speed: speed,
            raw_score,
            penalty,
            effective,
        },
    )
}

/// Whether an event date is close enough to flag the lead urgent.
pub fn is_last_minute(event_date: Option<NaiveDate>, today: NaiveDate) -> bool {
    match event_date {
        Some(date) => {
            let days_out = (date - today).num_days();
            (0..=LAST_MINUTE_DAYS).contains(&days_out)
        }
        None => false,
    }
}

/// Share of optional inquiry fields the planner filled in, as a percentage.
pub fn form_completeness(req: &SubmitLeadRequest) -> i32 {
    let optional_fields = [
        req.event_date.is_some(),
        req.event_time.is_some(),
        req.state.is_some(),
        req.venue_name.is_some(),
        req.guest_count.is_some(),
        req.budget_min.is_some() || req.budget_max.is_some(),
        req.planner_phone.is_some(),
        req.special_requests.is_some(),
    ];
    let filled = optional_fields.iter().filter(|f| **f).count();
    (filled * 100 / optional_fields.len()) as i32
}

/// Lead quality score (0-100) from budget, event type, completeness, guest
/// count and urgency.
pub fn lead_quality_score(
    budget: Option<f64>,
    event_type: &str,
    has_date: bool,
    has_venue: bool,
    has_phone: bool,
    guest_count: Option<i32>,
    last_minute: bool,
) -> i32 {
    let mut score = 0i32;

    // Budget scoring (0-30 points)
    if let Some(budget) = budget {
        if budget >= 5000.0 {
            score += 30;
        } else if budget >= 2500.0 {
            score += 20;
        } else if budget >= 1000.0 {
            score += 10;
        } else if budget >= 500.0 {
            score += 5;
        }
    }

    // Event type scoring (0-15 points)
    match event_type {
        "wedding" => score += 15,
        "corporate" => score += 10,
        "birthday" => score += 8,
        "school_dance" => score += 5,
        _ => {}
    }

    // Completeness scoring (0-25 points)
    if has_date {
        score += 10;
    }
    if has_venue {
        score += 10;
    }
    if has_phone {
        score += 5;
    }

    // Guest count scoring (0-5 points)
    if let Some(guests) = guest_count {
        if guests >= 200 {
            score += 5;
        } else if guests >= 100 {
            score += 3;
        } else if guests >= 50 {
            score += 1;
        }
    }

    // Urgency scoring (0-10 points)
    if last_minute {
        score += 10;
    }

    score.clamp(0, 100)
}
