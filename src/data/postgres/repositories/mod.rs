//! Storage repositories
//!
//! Each repository borrows the shared pool and owns the SQL for one concern.

pub mod alarms;
pub mod hidden;
pub mod history;
pub mod properties;
pub mod stats;

pub use alarms::{
    AlarmHistoryEntry, AlarmRepo, AlarmRule, AlarmRuleType, AlarmStateKind, AlarmStateRow,
    AlarmStateUpdate, NewAlarmRule,
};
pub use hidden::{HiddenItem, HiddenRepo};
pub use history::{HistoryPoint, HistoryRepo, MetricSeries, WindowQuery};
pub use properties::PropertyRepo;
pub use stats::{MonthUsage, StatsRepo, StorageStats, TableStats, UsageStats};
