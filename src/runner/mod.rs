pub mod context;
pub mod display;
pub mod observer;
pub mod report;
pub mod result;
pub mod scheduler;
pub mod status;
