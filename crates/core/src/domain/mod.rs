pub mod actor;
pub mod approval;
pub mod process;
pub mod step;
