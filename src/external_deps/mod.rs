//! Integrations that rely on third-party services.
//!
//! Alert channels (SMTP, webhooks) and the remote clearance solver live here so
//! the monitor and executor only see the [`alerts::AlertSink`] and
//! [`clearance::ClearanceSolver`] seams.

pub mod alerts;
pub mod clearance;

pub use alerts::{AlertError, AlertSink, EmailAlertSink, WebhookAlertSink};
pub use clearance::{ClearanceError, ClearanceSolver, RemoteClearanceSolver};
