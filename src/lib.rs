//! Shop Policy Compliance Analysis Engine
//!
//! This library provides the core functionality for the policy-audit system:
//! an asynchronous pipeline that checks shop policy documents against
//! regulatory rules using LLM providers with failover, quota tracking, and
//! graceful degradation, and streams per-job progress to subscribers.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
