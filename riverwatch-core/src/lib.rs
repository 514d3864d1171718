//! Core engine for adaptive river-gauge polling: state persistence, upstream
//! adapters, cadence/latency learning, scheduling, and the poll loop itself.
//! `riverwatch-cli` is the thin bootstrap/bin wrapper around this crate.

pub mod adapters;
pub mod blended;
pub mod cadence;
pub mod clock;
pub mod community;
pub mod config;
pub mod error;
pub mod http;
pub mod latency;
pub mod logging;
pub mod model;
pub mod overlay;
pub mod poll_loop;
pub mod predictor;
pub mod scheduler;
pub mod state;

pub use clock::{Clock, StepClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use poll_loop::{ManualOverrides, PollLoop, PollLoopConfig};
pub use state::{StateDocument, StateLock, StateStore};
