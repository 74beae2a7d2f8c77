//! Function-based repositories over the gateway tables.
//!
//! Each table exposes the same small surface: `get_all_*`, `get_*`,
//! `insert_*`, `update_*` and `delete_*`, all taking a borrowed
//! `rusqlite::Connection`.

pub mod chat_group;
pub mod peer;
pub mod session;
