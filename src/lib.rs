//! Conduit: an asynchronous message broker and pipeline orchestrator that
//! routes data through phased domain stages, with control points for human
//! approval and staged results between stages.

pub mod broker;
pub mod config;
pub mod control_point;
pub mod domains;
pub mod errors;
pub mod gates;
pub mod logging;
pub mod phase;
pub mod pipeline;
pub mod repository;
pub mod retry;
pub mod service;
pub mod staging;
pub mod ui;
