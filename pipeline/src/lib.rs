//! Motion-detection pipeline: background differencing, event tracking and
//! the latest-value broadcast distributor that fans processed frames out to
//! stream consumers.

pub mod detector;
pub mod distributor;
pub mod events;
pub mod publications;
pub mod source;
pub mod store;
