//! Ticket Relay - crash-safe delivery of tracker updates to a remote ticketing API.
//!
//! Producers append tasks to a per-destination [`queue::DurableQueue`]; the relay
//! daemon drains each queue in order through an authenticated
//! [`ticket::TicketClient`], pacing retries by error class.

pub mod auth;
pub mod dispatch;
pub mod persistence;
pub mod queue;
pub mod relay;
pub mod retry;
pub mod ticket;
pub mod types;
