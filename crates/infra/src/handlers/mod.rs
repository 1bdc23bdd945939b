//! Task handlers and the registry wiring for them.

use std::sync::Arc;

use crate::db::Database;
use crate::tasks::registry::HandlerRegistry;
use crate::tasks::types::TaskKind;

pub mod send_verify_email;

pub use send_verify_email::{
    LogVerificationSender, SendError, SendVerifyEmailHandler, SendVerifyEmailPayload, VerificationSender,
    send_verify_email_task,
};

/// Registry with every built-in handler registered.
pub fn default_registry(db: Arc<dyn Database>, sender: Arc<dyn VerificationSender>) -> HandlerRegistry {
    HandlerRegistry::new().with(
        TaskKind::SendVerifyEmail,
        Arc::new(SendVerifyEmailHandler::new(db, sender)),
    )
}
