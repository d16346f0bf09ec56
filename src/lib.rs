//! certflow: a certification lifecycle engine.
//!
//! Applications move through a fixed state graph from DRAFT to
//! CERTIFICATE_ISSUED. Transitions are guarded by business rules, committed
//! with optimistic concurrency together with an append-only history entry and
//! their side-effect commands, and those commands are delivered at-least-once
//! by the outbox drainer.

pub mod audit;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod outbox;
pub mod repository;
pub mod service;
pub mod state_machine;
pub mod telemetry;
pub mod validator;
