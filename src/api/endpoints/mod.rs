//! API endpoint handlers outside the encrypted gateway.

pub mod health;
pub mod pair;
