use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============ State Enums ============

/// Routing lifecycle of a lead.
///
/// `Assigned`, `Exhausted`, `Converted` and `Withdrawn` are terminal and
/// immutable (an exhausted lead can only re-enter routing through operator
/// requeue, which resets it to `Routing`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "routing_state", rename_all = "snake_case")]
pub enum RoutingState {
    /// Created, not yet picked up by the routing engine.
    Pending,
    /// Actively moving through exclusivity phases.
    Routing,
    /// A performer accepted; offers closed.
    Assigned,
    /// No eligible performer accepted within any phase window.
    Exhausted,
    /// Booking confirmed out-of-band after acceptance.
    Converted,
    /// Planner cancelled.
    Withdrawn,
}

impl RoutingState {
    /// Whether this state admits no further routing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RoutingState::Assigned
                | RoutingState::Exhausted
                | RoutingState::Converted
                | RoutingState::Withdrawn
        )
    }
}

/// Offer phase a lead is currently in while `routing_state = 'routing'`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "lead_phase", rename_all = "snake_case")]
pub enum LeadPhase {
    /// Single top-ranked candidate, short exclusivity window.
    Exclusive,
    /// Small fan-out of simultaneous non-exclusive offers.
    Broadcast,
    /// All remaining eligible candidates, extended window.
    Open,
}

impl LeadPhase {
    /// The phase that follows this one when its window lapses without an
    /// acceptance. `Open` has no successor: the lead exhausts.
    pub fn next(&self) -> Option<LeadPhase> {
        match self {
            LeadPhase::Exclusive => Some(LeadPhase::Broadcast),
            LeadPhase::Broadcast => Some(LeadPhase::Open),
            LeadPhase::Open => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadPhase::Exclusive => "exclusive",
            LeadPhase::Broadcast => "broadcast",
            LeadPhase::Open => "open",
        }
    }
}

/// Per-assignment response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "response_status", rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Offer outstanding.
    Pending,
    Accepted,
    Declined,
    /// Viewed the offer but never responded before the window lapsed.
    Ignored,
    /// Window lapsed without the offer ever being viewed, or force-closed by
    /// a sibling's winning acceptance or planner withdrawal.
    Expired,
}

impl ResponseStatus {
    /// Terminal statuses never transition again; duplicate responses against
    /// them are idempotent no-ops.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResponseStatus::Pending)
    }
}

/// Outcome fed into the metrics store. Superset of assignment statuses:
/// `Converted` and `LeadLost` arrive from the booking collaborator after the
/// routing decision closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    Declined,
    Ignored,
    Expired,
    Converted,
    LeadLost,
}

/// Action a performer can take on an assignment. Ignore/expire outcomes are
/// produced by the expiry sweep, never submitted directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    Accept,
    Decline,
}

// ============ Database Models ============

/// A booking inquiry moving through the routing engine.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Lead {
    /// Unique identifier for the lead.
    pub id: Uuid,
    /// Event type (e.g. "wedding", "corporate", "birthday").
    pub event_type: String,
    /// Event date, if the planner provided one.
    pub event_date: Option<NaiveDate>,
    /// Free-text event start time.
    pub event_time: Option<String>,
    /// Event city.
    pub city: String,
    /// Event state/region code.
    pub state: Option<String>,
    /// Venue name, if known.
    pub venue_name: Option<String>,
    /// Expected guest count.
    pub guest_count: Option<i32>,
    /// Lower bound of the planner's budget.
    pub budget_min: Option<BigDecimal>,
    /// Upper bound of the planner's budget.
    pub budget_max: Option<BigDecimal>,
    /// Midpoint of the budget range, computed at submission.
    pub budget_midpoint: Option<BigDecimal>,
    /// Planner display name.
    pub planner_name: String,
    /// Planner contact email.
    pub planner_email: String,
    /// Planner phone in E.164, if provided and valid.
    pub planner_phone: Option<String>,
    /// Free-text requests from the inquiry form.
    pub special_requests: Option<String>,
    /// Whether the event date is near enough to treat as urgent.
    pub is_last_minute: bool,
    /// Share of optional form fields the planner filled in (0-100).
    pub form_completeness: i32,
    /// Lead quality score (0-100) from completeness + budget + urgency.
    pub lead_score: i32,
    /// Routing lifecycle state.
    pub routing_state: RoutingState,
    /// Current offer phase while routing.
    pub current_phase: Option<LeadPhase>,
    /// When the current phase's window lapses.
    pub phase_deadline: Option<DateTime<Utc>>,
    /// Recorded reason when the lead exhausted (e.g. "no_eligible_performers").
    pub exhausted_reason: Option<String>,
    /// Winning performer once assigned.
    pub assigned_performer_id: Option<Uuid>,
    /// When routing first started.
    pub routed_at: Option<DateTime<Utc>>,
    /// Timestamp of creation.
    pub created_at: DateTime<Utc>,
    /// Timestamp of last update.
    pub updated_at: Option<DateTime<Utc>>,
}

/// A performer profile as the selector sees it. Profile CRUD lives in the
/// dashboard collaborator; the engine only reads these rows.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PerformerProfile {
    pub id: Uuid,
    pub display_name: String,
    /// Home city.
    pub city: Option<String>,
    /// Home state/region code.
    pub state: Option<String>,
    /// States this performer serves.
    pub service_states: Vec<String>,
    /// Cities this performer serves.
    pub service_cities: Vec<String>,
    /// Event types this performer accepts.
    pub event_types: Vec<String>,
    /// Lower bound of the performer's price range.
    pub price_min: Option<BigDecimal>,
    /// Upper bound of the performer's price range.
    pub price_max: Option<BigDecimal>,
    /// Whether the performer currently takes routed leads.
    pub accepts_leads: bool,
    /// Monthly routed-lead cap; NULL means uncapped.
    pub max_leads_per_month: Option<i32>,
    /// Soft-delete flag.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-performer reliability and performance counters.
///
/// Lifetime counters only ever increase; window rates are recomputed from
/// assignment history after every outcome. The routing score is never stored
/// here; it is recomputed from this snapshot on every selection.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PerformerRoutingMetrics {
    pub performer_id: Uuid,
    /// Lifetime accepted offers.
    pub accepted_count: i64,
    /// Lifetime declined offers.
    pub declined_count: i64,
    /// Lifetime ignored offers.
    pub ignored_count: i64,
    /// Lifetime expired (never-viewed) offers.
    pub expired_count: i64,
    /// Lifetime conversions (accepted offers that became bookings).
    pub converted_count: i64,
    /// Lifetime accepted-then-lost leads.
    pub lost_count: i64,
    /// Current run of consecutive ignores; resets on any other response.
    pub consecutive_ignores: i32,
    /// Acceptance rate over the rolling window.
    pub acceptance_rate: f64,
    /// Decline rate over the rolling window.
    pub decline_rate: f64,
    /// Ignore rate over the rolling window.
    pub ignore_rate: f64,
    /// Conversions per acceptance over the rolling window.
    pub conversion_rate: f64,
    /// Average response latency in seconds over the rolling window.
    pub avg_response_secs: Option<f64>,
    /// Reliability score in [0,1], maintained from outcome history.
    pub reliability_score: f64,
    /// Anti-abuse penalty last applied; decays on read, never in place.
    pub recent_lead_penalty: f64,
    /// When the penalty above was last applied.
    pub last_penalty_applied_at: Option<DateTime<Utc>>,
    /// Performer is ineligible until this instant passes.
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Hard ineligibility flag; cleared only by operator review.
    pub is_suspended: bool,
    pub suspension_reason: Option<String>,
    /// Last time this performer received any routed offer (fairness tie-break).
    pub last_routed_at: Option<DateTime<Utc>>,
    /// Routed leads in the current calendar month.
    pub leads_this_month: i32,
    /// First day of the month `leads_this_month` counts against.
    pub month_anchor: NaiveDate,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PerformerRoutingMetrics {
    /// Neutral starting metrics for a performer with no outcome history yet.
    /// Mirrors the column defaults in the schema.
    pub fn fresh(performer_id: Uuid, month_anchor: NaiveDate) -> Self {
        Self {
            performer_id,
            accepted_count: 0,
            declined_count: 0,
            ignored_count: 0,
            expired_count: 0,
            converted_count: 0,
            lost_count: 0,
            consecutive_ignores: 0,
            acceptance_rate: 0.0,
            decline_rate: 0.0,
            ignore_rate: 0.0,
            conversion_rate: 0.0,
            avg_response_secs: None,
            reliability_score: 0.5,
            recent_lead_penalty: 0.0,
            last_penalty_applied_at: None,
            cooldown_until: None,
            is_suspended: false,
            suspension_reason: None,
            last_routed_at: None,
            leads_this_month: 0,
            month_anchor,
            updated_at: None,
        }
    }
}

/// Fixed, explicit record of scoring contributions, snapshotted onto each
/// assignment for audit. One named field per scoring term, so the breakdown
/// is statically verifiable rather than an open-ended map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Weighted reliability contribution.
    pub reliability: f64,
    /// Weighted acceptance-rate contribution.
    pub acceptance: f64,
    /// Weighted conversion-rate contribution.
    pub conversion: f64,
    /// Weighted budget-fit contribution.
    pub budget_fit: f64,
    /// Weighted response-speed contribution.
    pub response_speed: f64,
    /// Sum of the weighted terms before the penalty.
    pub raw_score: f64,
    /// Decayed penalty applied multiplicatively.
    pub penalty: f64,
    /// Final score: `raw_score * (1 - penalty)`.
    pub effective: f64,
}

/// One offer of a lead to a performer within a phase.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LeadAssignment {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub performer_id: Uuid,
    /// Phase this offer belongs to.
    pub phase: LeadPhase,
    /// Rank order within the phase; tie-break for display and audit.
    pub priority: i32,
    /// When the phase window opened. Timers run from here regardless of
    /// notification delivery.
    pub phase_started_at: DateTime<Utc>,
    /// When the offer lapses.
    pub phase_expires_at: DateTime<Utc>,
    /// Exclusivity window end; set only on exclusive-phase assignments,
    /// where it coincides with `phase_expires_at`.
    pub exclusivity_until: Option<DateTime<Utc>>,
    /// When the notification request was emitted.
    pub notified_at: Option<DateTime<Utc>>,
    /// When the performer responded.
    pub responded_at: Option<DateTime<Utc>>,
    pub response_status: ResponseStatus,
    /// Seconds between notification and response.
    pub response_latency_secs: Option<f64>,
    /// Routing score at the moment of assignment. Snapshot, never updated.
    pub routing_score_at_assignment: f64,
    /// Scoring term breakdown at assignment time.
    pub score_breakdown: sqlx::types::Json<ScoreBreakdown>,
    /// Token embedded in the notification's response link.
    pub response_token: String,
    pub created_at: DateTime<Utc>,
}

/// Coarse per-(lead, performer) audit trail, independent of phase
/// granularity. Used for reporting, never for routing decisions.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LeadDistribution {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub performer_id: Uuid,
    pub contacted_at: Option<DateTime<Utc>>,
    pub viewed_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub declined_at: Option<DateTime<Utc>>,
    pub decline_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A single planner inquiry fanned out to several named performers at once.
/// Distinct from phased routing; read-only after creation except for the
/// availability counters.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MultiInquiry {
    pub id: Uuid,
    pub planner_name: String,
    pub planner_email: String,
    pub planner_phone: Option<String>,
    pub event_type: String,
    pub event_date: Option<NaiveDate>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub venue_name: Option<String>,
    pub guest_count: Option<i32>,
    pub budget: Option<BigDecimal>,
    pub special_requests: Option<String>,
    /// Lead quality score computed at submission.
    pub lead_score: i32,
    pub performers_contacted: i32,
    pub performers_available: i32,
    pub performers_unavailable: i32,
    pub created_at: DateTime<Utc>,
}

// ============ API Request/Response Models ============

/// Request payload for submitting a new lead.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitLeadRequest {
    pub event_type: String,
    pub event_date: Option<NaiveDate>,
    pub event_time: Option<String>,
    pub city: String,
    pub state: Option<String>,
    pub venue_name: Option<String>,
    pub guest_count: Option<i32>,
    pub budget_min: Option<f64>,
    pub budget_max: Option<f64>,
    pub planner_name: String,
    pub planner_email: String,
    pub planner_phone: Option<String>,
    pub special_requests: Option<String>,
}

/// CRM-facing view of a single assignment.
#[derive(Debug, Clone, Serialize)]
pub struct AssignmentView {
    pub id: Uuid,
    pub performer_id: Uuid,
    pub phase: LeadPhase,
    pub priority: i32,
    pub response_status: ResponseStatus,
    pub phase_expires_at: DateTime<Utc>,
    pub routing_score_at_assignment: f64,
    pub responded_at: Option<DateTime<Utc>>,
}

impl From<&LeadAssignment> for AssignmentView {
    fn from(a: &LeadAssignment) -> Self {
        Self {
            id: a.id,
            performer_id: a.performer_id,
            phase: a.phase,
            priority: a.priority,
            response_status: a.response_status,
            phase_expires_at: a.phase_expires_at,
            routing_score_at_assignment: a.routing_score_at_assignment,
            responded_at: a.responded_at,
        }
    }
}

/// Response payload for lead queries: the lead plus its offer history.
#[derive(Debug, Serialize)]
pub struct LeadStatusResponse {
    pub lead: Lead,
    pub assignments: Vec<AssignmentView>,
}

/// Performer response to an offer, from the notification-reply collaborator
/// (SMS/email click or dashboard button).
#[derive(Debug, Clone, Deserialize)]
pub struct PerformerResponseRequest {
    pub action: ResponseAction,
    /// Response-link token from the notification; validated when present.
    pub token: Option<String>,
    /// Optional free-text reason on decline, kept in the audit trail.
    pub decline_reason: Option<String>,
}

/// Operator override of a performer's suspension state, optionally with a
/// time-boxed cooldown instead of (or alongside) the hard flag.
#[derive(Debug, Clone, Deserialize)]
pub struct SuspensionOverrideRequest {
    pub suspended: bool,
    pub reason: Option<String>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Booking confirmation from the billing/CRM collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct ConvertedRequest {
    pub performer_id: Uuid,
}

/// Request payload for a multi-performer inquiry.
#[derive(Debug, Clone, Deserialize)]
pub struct MultiInquiryRequest {
    pub planner_name: String,
    pub planner_email: String,
    pub planner_phone: Option<String>,
    pub event_type: String,
    pub event_date: Option<NaiveDate>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub venue_name: Option<String>,
    pub guest_count: Option<i32>,
    pub budget: Option<f64>,
    pub special_requests: Option<String>,
    pub performer_ids: Vec<Uuid>,
}

/// Response payload for a multi-performer inquiry.
#[derive(Debug, Serialize)]
pub struct MultiInquiryResponse {
    pub id: Uuid,
    pub lead_score: i32,
    pub performers_contacted: i32,
    pub performers_available: i32,
    pub performers_unavailable: i32,
}

/// Operator view of a performer's metrics with the score recomputed live.
#[derive(Debug, Serialize)]
pub struct MetricsView {
    pub metrics: PerformerRoutingMetrics,
    /// Score against a neutral lead, for operator inspection. Absent while
    /// the performer is suspended or cooling down.
    pub current_routing_score: Option<f64>,
    pub breakdown: Option<ScoreBreakdown>,
}
