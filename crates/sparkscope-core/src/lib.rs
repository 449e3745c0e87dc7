//! sparkscope-core: in-process profiling and statistics engine
//!
//! Samples stack traces and runtime metrics of a long-running server process,
//! aggregates them into rolling summaries, and reports to operators on demand
//! or continuously.
//!
//! # Architecture
//!
//! ```text
//! StackCapture ──► SamplerSession ──► CallTreeMerger ──► Exporter ──► ResultSink / file
//!                        ▲
//!   SamplerContainer ────┘ (one active slot; background sessions yield)
//!
//! TickSource ──► TickStatistics (tps, durations)
//!     │
//!     └────────► TickGcMonitor ◄── GcHub
//!
//! Operator command ──► CommandWatchdog (FIFO, stuck warnings) ──► Platform
//! ```
//!
//! # Modules
//!
//! - `rolling_window`: Fixed-capacity weighted rolling statistics
//! - `thread_policy`: Which threads to capture and how to group them
//! - `capture`: Stack snapshot model and the capture primitive trait
//! - `call_tree`: Arena call trees and merge modes
//! - `sampler`: Session state machine and capture loop
//! - `container`: The single active-session slot
//! - `background`: Always-on background profiler
//! - `tick_monitor`: Tick baseline and anomaly/GC correlation
//! - `gc`: GC events, reports and per-collector statistics
//! - `tick_stats`: TPS and tick-duration windows
//! - `ping`: Player ping statistics
//! - `cpu`: System and process CPU usage windows
//! - `watchdog`: Serialised command execution with stuck-command warnings
//! - `trust`: Live viewer trust gate
//! - `export`: Session results, upload/save, activity log
//! - `display`: Operator message output
//! - `format` / `health`: Statistics text
//! - `platform`: Composition root
//! - `config`, `error`, `logging`: Configuration, errors and tracing setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod background;
pub mod call_tree;
pub mod capture;
pub mod config;
pub mod container;
pub mod cpu;
pub mod display;
pub mod error;
pub mod export;
pub mod format;
pub mod gc;
pub mod health;
pub mod logging;
pub mod ping;
pub mod platform;
pub mod rolling_window;
pub mod sampler;
pub mod thread_policy;
pub mod tick_monitor;
pub mod tick_stats;
pub mod trust;
pub mod watchdog;

pub use error::{Error, Result};
pub use platform::{Collaborators, Platform, StartRequest};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
