//! Host-side API reachable from modules through the syscall channel

pub mod events;
pub mod gateway;
pub mod http;
pub mod kv;
pub mod rate_limit;

pub use events::{
    sink_from_config, ChannelEventSink, EventEnvelope, EventError, EventPublisher, EventSink,
    HttpEventSink, LifecycleEvent, LogEventSink,
};
pub use gateway::{GatewaySession, SyscallGateway};
pub use http::{FetchError, FetchOutcome, FetchRequest, HttpFetcher, ReqwestFetcher};
pub use kv::{KvError, KvStore};
pub use rate_limit::{SyscallRateLimiter, TokenBucket};
