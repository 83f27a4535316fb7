#![forbid(unsafe_code)]

//! # hpcflow
//!
//! The shared code for hpcflow. Encapsulates abstractions for things like:
//!
//! - Remote command execution over SSH and live log streaming
//! - Batch-scheduler (Slurm) status queries
//! - In-memory job tracking with background reconciliation
//! - A content-addressed cache of pipeline step outputs
//! - Running a pipeline engine with cache restore/store around it

pub mod cache;
pub mod config;
pub mod executor;
#[doc(hidden)]
pub mod ipc;
pub mod jobs;
pub mod log;
pub mod pipeline;
pub mod remote;
