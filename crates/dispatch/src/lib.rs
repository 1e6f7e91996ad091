//! Delivery side of the drip engine: the dispatch scheduler, the lease
//! sweeper, trigger intake and the collaborator traits for contacts,
//! rendering and mail transport.

pub mod contacts;
pub mod intake;
pub mod renderer;
pub mod retry;
pub mod scheduler;
pub mod sweeper;
pub mod transport;

pub use contacts::{Contact, ContactDirectory, InMemoryContacts};
pub use intake::{IntakeOutcome, TriggerIntake};
pub use renderer::{MergeTagRenderer, RenderedEmail, TemplateRenderer};
pub use retry::{RetryPolicy, StoreRetry};
pub use scheduler::{CycleReport, DispatchScheduler};
pub use sweeper::LeaseSweeper;
pub use transport::{LogTransport, MailTransport, OutboundEmail};
