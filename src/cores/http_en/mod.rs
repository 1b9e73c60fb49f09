pub mod client;
pub use client::{ClientMode, RateLimiter, SprayClient, SprayClientConfig, SprayResponse};
pub mod request;
pub use request::{build_host_request, build_path_request, SprayRequest};
