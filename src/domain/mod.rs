//! Domain services: ingress pipeline, alarm engine, hidden filter, delete
//! cascade, broadcast events.

pub mod alarms;
pub mod delete;
pub mod events;
pub mod hidden;
pub mod ingress;

pub use alarms::AlarmEngine;
pub use delete::DeleteCascade;
pub use events::{AlarmTransition, MetricUpdate};
pub use hidden::HiddenItems;
pub use ingress::SparkplugIngress;
