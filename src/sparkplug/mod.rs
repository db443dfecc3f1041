//! Embedded Sparkplug-B library
//!
//! Protobuf schema ([`proto`]), decode into a [`payload::DecodedPayload`]
//! record, the `spBv1.0` topic grammar ([`topic`]) and the NCMD/DCMD command
//! write path ([`command`]).

pub mod command;
pub mod payload;
pub mod proto;
pub mod topic;

pub use command::MetricCommander;
pub use payload::{DecodeError, DecodedMetric, DecodedPayload};
pub use topic::{MessageKind, SparkplugTopic};
