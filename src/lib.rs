//! Songsmith generation service
//!
//! Runs music generation jobs one at a time on a single engine slot. Jobs are
//! admitted into a bounded FIFO queue, executed by a background worker,
//! streamed to their owner's live observers and recorded in a job store
//! that backs the history view.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
