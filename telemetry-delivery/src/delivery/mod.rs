//! Delivery of telemetry to the remote collector.

pub mod http;
pub mod lanes;
pub mod rate_limit;
pub mod response;
pub mod retry_queue;
pub mod service;
pub mod transport;
pub mod types;
pub mod worker;

pub use http::HttpTransport;
pub use rate_limit::{RateLimitHandler, RateLimitState};
pub use response::{ApiResponse, HttpResponse, TransportError};
pub use retry_queue::RetryQueue;
pub use service::{DeliveryParts, DeliveryService, EnvelopeDelivery};
pub use transport::Transport;
pub use types::{DeliveryEvent, DropReason, FetchOutcome, NetworkStatus, PendingDelivery, QueueReason, SendOutcome};
pub use worker::WorkerPool;
