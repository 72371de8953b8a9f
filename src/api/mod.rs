pub mod client;
pub mod models;
pub mod submission;

pub use client::{AlertApi, ApiClient};
pub use models::*;
pub use submission::{
    validate_alert_request, Connectivity, DrainReport, PendingPayload, PendingQueue,
    PendingSubmission, SubmissionService,
};
