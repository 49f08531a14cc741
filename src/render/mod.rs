//! Rendering system and GPU interfaces

pub mod backend;
pub mod context;
pub mod pipeline;
pub mod taa;
