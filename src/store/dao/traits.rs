//! DAO trait definitions
//!
//! One trait per aggregate so the coordinator can be handed the narrowest view it needs.

mod book;
mod task;

pub use book::BookDao;
pub use task::TaskDao;
