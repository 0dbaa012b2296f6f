//! courier-mailbox: recipient-indexed transfer storage for the relay
//!
//! Records are stored through an OpenDAL operator, so the same mailbox runs on
//! a local directory, in memory, or on any S3-compatible bucket.

pub mod health;
pub mod locks;
pub mod mailbox;
pub mod operator;

pub use health::{check_health, is_healthy};
pub use mailbox::Mailbox;
pub use operator::{build_operator, memory_operator};
