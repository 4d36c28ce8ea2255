//! Delivery of job events to observers: the in-process hub, per-job
//! subscriptions and the HTTP/WebSocket surface built on them.

pub mod api;
pub mod hub;
pub mod subscription;
mod ws;

pub use api::{AppState, api_routes};
pub use hub::{EventHub, JobNotice};
pub use subscription::{DeliveryEvent, EventDelivery, Subscription};
