pub mod dot;
pub mod run_result;
