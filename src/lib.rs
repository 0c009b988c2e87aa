//! spamsift — concurrent spam-report pipeline.

pub mod config;
pub mod directory;
pub mod error;
pub mod pipeline;
