//! Background health monitoring
//!
//! A single long-lived worker polls agent connectivity from the cloud
//! control plane, classifies a health verdict, and dispatches alerts to
//! the configured notification sinks.

pub mod health;
pub mod sinks;

pub use health::{HealthMonitor, HealthVerdict, MonitorConfig, MonitorDeps, MonitorState};
pub use sinks::{ChatSink, NotificationSink, PagerSink};
