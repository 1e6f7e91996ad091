//! Sequence automation: drip sequences, contact enrollments and the
//! scheduled emails that carry each enrollment from one step to the next.

pub mod editor;
pub mod enrollment;
pub mod schedule;
pub mod state_machine;
pub mod store;
pub mod trigger;
pub mod types;

pub use editor::{EditReport, NewSequence, SequenceEditor};
pub use enrollment::{EnrollmentManager, FailureOutcome};
pub use store::{EnrollmentRepair, Repair, SequenceStore, StoreSnapshot};
pub use trigger::{ContactEvent, ContactEventKind, EnrollmentRequest, TriggerEvaluator};
