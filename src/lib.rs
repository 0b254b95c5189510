//! Audience reachability verification
//!
//! Library behind the `audience-verify` API server and its `worker` binary.
//! A bot's audience is pinged one record at a time under a global rate
//! limit, with durable progress so a crashed or restarted worker resumes each
//! job exactly where it stopped.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
