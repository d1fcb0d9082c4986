pub mod generation;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod worker;
