// Grimoire - authoritative storyteller server
//
// This crate provides the room runtime for a social-deduction tabletop game:
// a per-room single-writer command pipeline over a durable event log, with
// per-viewer projected fan-out and an asynchronous AI storyteller side-channel.

pub mod ai;
pub mod common;
pub mod config;
pub mod engine;
pub mod jobs;
pub mod projection;
pub mod realtime;
pub mod room;
pub mod server;
pub mod store;
pub mod tools;

pub use config::*;
