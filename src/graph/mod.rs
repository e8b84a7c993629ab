pub mod analysis;
pub mod builder;
pub mod dependency;
pub mod node;
pub mod readiness;
