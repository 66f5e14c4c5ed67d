//! Long-running tasks of the delivery hub
//!
//! Each actor runs as an independent async task communicating via Tokio channels.
//!
//! ## Architecture Overview
//!
//! ```text
//!   TriggerHandle (05:30)         TriggerHandle (21:30)
//!   Scheduler::schedule_daily     FallbackAssigner::run_fallback
//!            │                              │
//!            └──────────► Scheduler::admit ◄┘
//!                              │
//!                        QueueManager ──► Scheduler::process_delivery
//!                              │                   │
//!                              ▼                   ▼
//!                        MonitorActor ◄──── DeliveryStore
//!                              │
//!                      AlertPublisher (broadcast)
//!                              │
//!                        AlertActor ──► webhook / Discord
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Events**: Alerts and dashboard snapshots are broadcast for fan-out
//! 3. **Request/Response**: oneshot channels for synchronous queries

pub mod alert;
pub mod messages;
pub mod monitor;
pub mod trigger;
