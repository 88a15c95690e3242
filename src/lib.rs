//! Frame-level video analysis and indexing.
//!
//! Videos are sampled into frames, every frame is scored for quality,
//! embedded, run through the registered prediction providers and written to
//! a buffered vector index. Frames are then linked to similar, neighbouring
//! and same-scene frames.

pub mod cancel;
pub mod config;
pub mod eid;
pub mod frame;
pub mod models;
pub mod predict;
pub mod probe;
pub mod quality;
pub mod queue;
pub mod report;
pub mod service;
pub mod store;
pub mod vector;

#[cfg(test)]
mod tests;
