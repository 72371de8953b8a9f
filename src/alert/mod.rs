pub mod escalation;
pub mod manager;
pub mod message;

pub use escalation::{CallEscalator, EscalationHandle, EscalationOutcome};
pub use manager::{AlertDeps, AlertManager};
pub use message::{build_emergency_message, split_message};
