pub mod barrier;
pub mod monitor;
pub mod suspend;
