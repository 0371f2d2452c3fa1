//! Upstream acquisition: rate gate, retries, circuit breaker, pagination,
//! chunked time-series fetches and the Kalshi and Polymarket adapters.

pub mod auth;
pub mod circuit_breaker;
pub mod error;
pub mod kalshi;
pub mod polymarket;
pub mod rate_gate;
pub mod rate_limited;
pub mod retry;
pub mod source;
pub mod transport;

pub use auth::Credentials;
pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use error::{FetchError, TransportError};
pub use kalshi::KalshiApi;
pub use polymarket::PolymarketApi;
pub use rate_gate::RateGate;
pub use rate_limited::{interval_count, plan_chunks, Chunk, Paginated, RateLimitedClient};
pub use retry::RetryPolicy;
pub use source::{CandleRequest, MarketDataSource, MarketQuery, SeriesQuery};
pub use transport::{HttpResponse, ReqwestTransport, Transport};
