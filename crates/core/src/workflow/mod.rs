pub mod machine;
pub mod ordering;
pub mod resolver;

pub use machine::{ApprovalMachine, DecisionCommand, Transition};
pub use ordering::{ReorderEntry, sequence_from_entries};
pub use resolver::StepResolver;
