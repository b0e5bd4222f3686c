//! # skywarden
//!
//! skywarden is an automated moderation engine for the AT Protocol. It reads
//! repository events from Jetstream, evaluates them against a set of
//! moderation rules, and applies the resulting labels, tags, reports and
//! notifications through an Ozone moderation service.
//!
//! ## Architecture Overview
//!
//! ### Consumption
//! - Jetstream events are converted into [`event::RepoEvent`] values
//! - Events are sharded by subject DID so one account is always evaluated in
//!   stream order while different accounts proceed concurrently
//! - The persisted cursor is the low-watermark of completed events
//!
//! ### Evaluation
//! - Each event resolves the subject's account metadata (identity, public
//!   profile facts, private moderation facts) through a read-through cache
//! - Rules receive a typed context and propose effects; they never call the
//!   moderation service directly
//! - A failing or panicking rule is logged and the other rules still run
//!
//! ### Effects
//! - Proposed effects are deduplicated per event and applied after all rules
//!   have run
//! - Application is idempotent so a redelivered event does not repeat
//!   moderation actions
//!
//! ## Configuration
//!
//! The service is configured via environment variables. Key variables include:
//! - `JETSTREAM_HOSTNAME`: Firehose endpoint
//! - `OZONE_HOST` / `OZONE_ADMIN_TOKEN`: Moderation service
//! - `REDIS_URL`: Shared counters, flags and cursor (optional)
//! - `RULES_CONFIG_PATH` / `SETS_JSON_PATH`: Policy sources
//!
//! ## Error Handling
//!
//! All error strings use the format: `error-skywarden-<domain>-<number> <message>: <details>`

/// Account metadata and the read-through account cache.
pub mod account;

/// Redis pool management and shared key layout.
pub mod cache;

/// Configuration management for the skywarden service.
///
/// Configuration is loaded from environment variables and validated at
/// startup.
pub mod config;

pub(crate) mod constants;

/// Jetstream consumption and per-subject sharding.
pub mod consumer;

/// Evaluation contexts handed to rules.
pub mod context;

/// Windowed event counters.
pub mod counters;

/// Firehose cursor persistence and the completed-event low-watermark.
pub mod cursor;

/// Moderation effects, their deduplication and application.
pub mod effects;

/// Event evaluation pipeline.
pub mod engine;

pub mod errors;

pub mod event;

/// Persistent internal flags on accounts and records.
pub mod flags;

/// Identity resolution and caching for AT Protocol DIDs.
pub mod identity_cache;

/// Metrics collection and monitoring for service observability.
pub mod metrics;

/// Polls Ozone for moderator actions and feeds them to the engine.
pub mod ozone_poller;

pub mod repo_fetch;

/// Moderation rules and the registry that builds rule sets from config.
pub mod rules;

/// Named string sets consulted by rules.
pub mod sets;

/// Background task supervision.
pub mod tasks;

/// XRPC clients for the AppView, Ozone and PDS hosts.
pub mod xrpc;

#[cfg(test)]
pub mod test_helpers;
