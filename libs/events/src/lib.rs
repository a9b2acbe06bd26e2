//! # fleet-events
//!
//! Health event definitions and bounded recent history for the relay fleet
//! controller.
//!
//! ## Design Principles
//!
//! - Events are immutable records of observed conditions and remediations
//! - Every event names exactly one subject (a replica, the balancer, or the
//!   container runtime)
//! - The controller keeps only a bounded recent-history buffer; long-term
//!   logging is an external concern

mod log;
mod types;

pub use log::EventLog;
pub use types::{EventKind, EventSubject, HealthEvent, Severity};
