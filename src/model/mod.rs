//! Domain model: telemetry identity, tagged metric values and the in-memory
//! topology tree.

pub mod identity;
pub mod topology;
pub mod value;

pub use identity::{IdentityScope, MetricIdentity};
pub use topology::{
    Device, Group, Host, MetricNode, MetricProperty, Node, TemplateDefinition, TemplateMember,
    TopologyService,
};
pub use value::{MetricValue, ValueColumn, column_for_type};
