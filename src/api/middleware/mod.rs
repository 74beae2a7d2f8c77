//! Gateway middleware stack.
//!
//! Execution order (outermost → innermost):
//! 1. Availability: 410 while shutting down, 403 while disabled
//! 2. Audit logger: method, path, caller id, status, latency
//! 3. Pairing rate limiter (pairing route only)

pub mod audit;
pub mod availability;
pub mod rate;
