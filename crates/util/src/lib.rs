//! Common Rust utilities used across meridian. Nothing in here knows about
//! consensus.

pub mod task;
