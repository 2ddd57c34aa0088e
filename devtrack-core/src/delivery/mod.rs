//! Delivery of device events to the remote collector
//!
//! A [`DeliveryClient`] tries each payload once through its [`Transport`]
//! and parks failures in the persistent queue. A [`Scheduler`] drains that
//! queue periodically, a bounded batch at a time, so a collector outage
//! costs at most `max_entries` of the oldest events and never blocks the
//! producer.

mod client;
mod scheduler;
mod transport;

pub use client::{DeliveryClient, DeliveryStats, DrainReport, SendOutcome};
pub use scheduler::Scheduler;
pub use transport::{DeliveryOutcome, HttpTransport, Transport};
