//! Persistence seams for books and their generation tasks.

mod error;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use postgres::PgStore;
pub use traits::{BookDao, TaskDao};
