pub mod core;
pub mod pipeline;
pub mod services;
pub mod workflow;
