//! Shared utilities / 共享工具

pub mod backoff;
pub mod rate_limiter;
pub mod ring_buffer;

pub use backoff::RetryPolicy;
pub use rate_limiter::TokenBucket;
pub use ring_buffer::RingBuffer;
