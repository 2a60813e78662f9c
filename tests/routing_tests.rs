/// Unit tests for routing decision logic
/// Tests the phase ladder, candidate ranking, suspension escalation and the
/// rolling-window rate computation, i.e. everything decidable from snapshots.
use chrono::{NaiveDate, TimeZone, Utc};
use dj_routing_api::config::RoutingConfig;
use dj_routing_api::metrics::{escalate_penalty, window_rates, WindowCounts};
use dj_routing_api::models::{
    LeadPhase, Outcome, PerformerRoutingMetrics, ResponseStatus, RoutingState, ScoreBreakdown,
};
use dj_routing_api::scheduler::{lapse_outcome, phase_capacity, phase_window};
use dj_routing_api::scoring::ScoreWeights;
use dj_routing_api::selector::{rank_candidates, CandidateInput};
use uuid::Uuid;

fn fresh(id: Uuid) -> PerformerRoutingMetrics {
    PerformerRoutingMetrics::fresh(id, NaiveDate::from_ymd_opt(2025, 6, 1).unwrap())
}

#[cfg(test)]
mod phase_ladder_tests {
    use super::*;

    #[test]
    fn test_ladder_order() {
        assert_eq!(LeadPhase::Exclusive.next(), Some(LeadPhase::Broadcast));
        assert_eq!(LeadPhase::Broadcast.next(), Some(LeadPhase::Open));
        assert_eq!(LeadPhase::Open.next(), None);
    }

    #[test]
    fn test_exclusive_phase_admits_one_candidate() {
        // The exclusive phase can never fan out, regardless of config.
        let mut config = RoutingConfig::default();
        config.broadcast_fan_out = 50;
        config.open_phase_cap = 500;
        assert_eq!(phase_capacity(&config, LeadPhase::Exclusive), 1);
    }

    #[test]
    fn test_windows_widen_down_the_ladder() {
        let config = RoutingConfig::default();
        let exclusive = phase_window(&config, LeadPhase::Exclusive);
        let broadcast = phase_window(&config, LeadPhase::Broadcast);
        let open = phase_window(&config, LeadPhase::Open);
        assert!(exclusive < broadcast);
        assert!(broadcast < open);
    }

    #[test]
    fn test_lapsed_exclusive_offer_is_expired_not_declined() {
        // An unanswered, never-viewed offer lapses to expired.
        assert_eq!(lapse_outcome(false), Outcome::Expired);
        // Viewed-but-silent is the ignore case that feeds the penalty.
        assert_eq!(lapse_outcome(true), Outcome::Ignored);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RoutingState::Pending.is_terminal());
        assert!(!RoutingState::Routing.is_terminal());
        assert!(RoutingState::Assigned.is_terminal());
        assert!(RoutingState::Exhausted.is_terminal());
        assert!(RoutingState::Converted.is_terminal());
        assert!(RoutingState::Withdrawn.is_terminal());

        assert!(!ResponseStatus::Pending.is_terminal());
        assert!(ResponseStatus::Accepted.is_terminal());
        assert!(ResponseStatus::Declined.is_terminal());
        assert!(ResponseStatus::Ignored.is_terminal());
        assert!(ResponseStatus::Expired.is_terminal());
    }
}

#[cfg(test)]
mod suspension_tests {
    use super::*;

    #[test]
    fn test_ignore_run_escalates_to_suspension_threshold() {
        // Five consecutive ignores at the default 0.15 increment: the
        // penalty climbs monotonically and stays capped below 1.0.
        let mut penalty = 0.0;
        for _ in 0..5 {
            let next = escalate_penalty(penalty, 0.15);
            assert!(next > penalty);
            assert!(next <= 1.0);
            penalty = next;
        }
        assert!((penalty - 0.75).abs() < 1e-9);

        // Well past the cap
        for _ in 0..10 {
            penalty = escalate_penalty(penalty, 0.15);
        }
        assert_eq!(penalty, 1.0);
    }

    #[test]
    fn test_suspended_performer_excluded_from_ranking() {
        // A performer past the ignore threshold is suspended, and selection
        // must exclude them even when they are the only profile that
        // matches.
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        let mut suspended = fresh(Uuid::new_v4());
        suspended.consecutive_ignores = 5;
        suspended.is_suspended = true;
        suspended.suspension_reason = Some("excessive_ignores".to_string());

        let ranked = rank_candidates(
            Some(2000.0),
            &[CandidateInput {
                price_min: Some(1500.0),
                price_max: Some(2500.0),
                metrics: suspended,
            }],
            &ScoreWeights::default(),
            0.094,
            now,
        );
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_full_penalty_floors_score_without_hiding_performer() {
        // A maxed-out penalty zeroes the score but, unlike suspension, the
        // performer still appears in the ranking.
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        let mut penalized = fresh(Uuid::new_v4());
        penalized.reliability_score = 1.0;
        penalized.recent_lead_penalty = 1.0;
        penalized.last_penalty_applied_at = Some(now);

        let ranked = rank_candidates(
            None,
            &[CandidateInput {
                price_min: None,
                price_max: None,
                metrics: penalized,
            }],
            &ScoreWeights::default(),
            0.094,
            now,
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].score, 0.0);
    }
}

#[cfg(test)]
mod window_rate_tests {
    use super::*;

    #[test]
    fn test_counts_never_produce_rates_out_of_bounds() {
        let rates = window_rates(&WindowCounts {
            accepted: 1,
            declined: 0,
            ignored: 0,
            expired: 0,
            converted: 1,
        });
        assert_eq!(rates.acceptance_rate, 1.0);
        assert_eq!(rates.conversion_rate, 1.0);
        assert_eq!(rates.reliability, 1.0);
    }

    #[test]
    fn test_accepted_then_never_converted_degrades_conversion() {
        let early = window_rates(&WindowCounts {
            accepted: 2,
            converted: 2,
            ..Default::default()
        });
        let late = window_rates(&WindowCounts {
            accepted: 6,
            converted: 2,
            ..Default::default()
        });
        assert!(late.conversion_rate < early.conversion_rate);
    }

    #[test]
    fn test_conversion_rate_zero_without_acceptances() {
        let rates = window_rates(&WindowCounts {
            declined: 3,
            ignored: 2,
            ..Default::default()
        });
        assert_eq!(rates.conversion_rate, 0.0);
    }
}

#[cfg(test)]
mod ranking_tests {
    use super::*;

    #[test]
    fn test_ranking_is_stable_and_deterministic() {
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let candidates: Vec<CandidateInput> = ids
            .iter()
            .map(|id| CandidateInput {
                price_min: Some(1000.0),
                price_max: Some(2000.0),
                metrics: fresh(*id),
            })
            .collect();

        let first = rank_candidates(
            Some(1500.0),
            &candidates,
            &ScoreWeights::default(),
            0.094,
            now,
        );
        let second = rank_candidates(
            Some(1500.0),
            &candidates,
            &ScoreWeights::default(),
            0.094,
            now,
        );
        let first_ids: Vec<Uuid> = first.iter().map(|c| c.performer_id).collect();
        let second_ids: Vec<Uuid> = second.iter().map(|c| c.performer_id).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[test]
    fn test_score_snapshot_breakdown_is_fixed_record() {
        // The audit breakdown serializes as one named field per scoring
        // term, not an open-ended map.
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        let mut m = fresh(Uuid::new_v4());
        m.reliability_score = 0.8;
        let ranked = rank_candidates(
            Some(1500.0),
            &[CandidateInput {
                price_min: Some(1000.0),
                price_max: Some(2000.0),
                metrics: m,
            }],
            &ScoreWeights::default(),
            0.094,
            now,
        );
        let json = serde_json::to_value(ranked[0].breakdown).unwrap();
        for field in [
            "reliability",
            "acceptance",
            "conversion",
            "budget_fit",
            "response_speed",
            "raw_score",
            "penalty",
            "effective",
        ] {
            assert!(json.get(field).is_some(), "missing breakdown field {}", field);
        }
        assert_eq!(json.as_object().unwrap().len(), 8);

        let back: ScoreBreakdown = serde_json::from_value(json).unwrap();
        assert_eq!(back, ranked[0].breakdown);
    }

    #[test]
    fn test_fan_out_slicing_respects_priority_order() {
        // Broadcast takes the next N by rank; capacity slicing must keep
        // the ranked order intact.
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        let mut candidates = Vec::new();
        for i in 0..6 {
            let mut m = fresh(Uuid::new_v4());
            m.reliability_score = 0.4 + 0.1 * i as f64;
            candidates.push(CandidateInput {
                price_min: Some(1000.0),
                price_max: Some(2000.0),
                metrics: m,
            });
        }
        let ranked = rank_candidates(
            Some(1500.0),
            &candidates,
            &ScoreWeights::default(),
            0.094,
            now,
        );

        let config = RoutingConfig::default();
        let fan_out = phase_capacity(&config, LeadPhase::Broadcast);
        let offered = &ranked[..fan_out.min(ranked.len())];
        assert_eq!(offered.len(), 4);
        for pair in offered.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        // The strongest candidate leads the slice
        assert_eq!(offered[0].performer_id, ranked[0].performer_id);
    }
}
