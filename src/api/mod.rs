pub mod cache;
pub mod cached_client;
pub mod client;
pub mod types;

pub use cache::CacheKey;
pub use cached_client::CachedClient;
pub use client::ApiClient;
