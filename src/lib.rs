//! DJ Lead Routing API Library
//!
//! This library provides the core functionality for the lead routing and
//! distribution engine: taking an inbound booking inquiry and deciding, over
//! phased exclusivity windows, which performers get access to it, then
//! tracking outcomes and performer reliability.
//!
//! # Modules
//!
//! - `circuit_breaker`: Circuit breaker for outbound notification sends.
//! - `config`: Configuration management and routing tunables.
//! - `db`: Database connection and pool management.
//! - `dispatcher`: Assignment creation and notification emission.
//! - `errors`: Error handling types.
//! - `handlers`: HTTP request handlers.
//! - `lifecycle`: Lead intake, withdrawal, re-injection, status queries.
//! - `metrics`: Per-performer reliability counters and rolling rates.
//! - `models`: Core data models.
//! - `multi_inquiry`: Multi-performer inquiry fan-out.
//! - `notifier`: Outbound collaborator clients (notifications, CRM events).
//! - `outcomes`: Performer responses, win resolution, conversions.
//! - `scheduler`: Phase state machine and expiry sweep.
//! - `scoring`: Pure routing-score and lead-score functions.
//! - `selector`: Candidate eligibility and ranking.

pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod errors;
pub mod handlers;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod multi_inquiry;
pub mod notifier;
pub mod outcomes;
pub mod scheduler;
pub mod scoring;
pub mod selector;
