// src/cloudpool/mod.rs

pub mod api_service;
pub mod client_handle;
pub mod config;
pub mod error;
pub mod execution_context;
pub mod http_client_pool;
pub mod proxy_config;

// Let's explicitly export the pool so it can be reached as cloudpool::HttpClientPool
// instead of cloudpool::cloudpool::http_client_pool::HttpClientPool
pub use http_client_pool::HttpClientPool;
