//! Switchboard: a control-plane daemon multiplexing interactive coding
//! agents (codex, claude, cursor, plain shells) over PTYs behind a single
//! line-delimited JSON stream protocol.

#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![warn(elided_lifetimes_in_paths)]
#![deny(unused_must_use)]

/// Launch composition per agent type.
pub mod agents;
/// Configuration loading (defaults, TOML, environment).
pub mod config;
/// Core domain types.
pub mod core;
/// Per-connection command dispatch.
pub mod dispatch;
/// GitHub capability (PR creation/lookup).
pub mod github;
/// Hook notify bridge (adapter JSONL files).
pub mod hooks;
/// Lifecycle hooks bridge (outbound connectors).
pub mod lifecycle;
/// Thread-title namer.
pub mod naming;
/// Wire protocol: envelopes, codec, commands, events.
pub mod protocol;
/// PTY sessions.
pub mod pty;
/// Subscription fan-out router.
pub mod router;
/// Daemon server wiring.
pub mod server;
/// Runtime status derivation.
pub mod status;
/// Durable state store.
pub mod store;
/// Session supervisor.
pub mod supervisor;
/// Telemetry ingest (OTLP HTTP).
pub mod telemetry;
