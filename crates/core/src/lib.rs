//! `visitrack-core`: domain building blocks shared by the write path and the
//! background task workers.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod user;

pub use error::DomainError;
pub use id::{TaskId, UserId};
pub use user::{NewUser, Role, User};
