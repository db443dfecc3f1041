//! Mantle ingests Sparkplug-B telemetry from MQTT brokers, maintains an
//! in-memory model of the observed industrial topology, persists samples into
//! a Postgres/TimescaleDB time-series store, evaluates per-metric alarm rules
//! with restart-safe delay timers, and serves a live query + subscription
//! surface.
//!
//! The crate is organised in layers:
//!
//! - [`model`]: identity, tagged metric values, the topology tree
//! - [`sparkplug`]: embedded Sparkplug-B payload codec and topic grammar
//! - [`data`]: storage (Postgres), hot-value cache (Redis), pub/sub fabric
//! - [`domain`]: ingress pipeline, alarm engine, hidden filter, delete cascade
//! - [`api`]: the operation surface a transport layer (GraphQL) binds to
//! - [`core`]: CLI, configuration, lifecycle

pub mod api;
pub mod core;
pub mod data;
pub mod domain;
pub mod model;
pub mod sparkplug;
pub mod utils;
