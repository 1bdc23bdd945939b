//! Infrastructure layer: transactional writes, task dispatch and background processing.
//!
//! Producers create a user and its verification task in one transaction
//! ([`user_service`]). Tasks reach a [`broker::Broker`] either through the
//! transactional [`outbox`] or directly through a
//! [`tasks::TaskDistributor`]; a [`tasks::TaskProcessor`] leases them,
//! dispatches to the handlers registered in a [`tasks::HandlerRegistry`], and
//! retries or dead-letters failures.

pub mod broker;
pub mod config;
pub mod db;
pub mod handlers;
pub mod outbox;
pub mod tasks;
pub mod user_service;
