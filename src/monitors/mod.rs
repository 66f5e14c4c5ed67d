//! Pure metric math used by the scheduler and the delivery monitor
//!
//! Nothing in here touches storage or the clock; callers gather the inputs
//! and these functions turn them into percentages, scores and alert
//! candidates.

pub mod health;
pub mod rules;
pub mod sla;
