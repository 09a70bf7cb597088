pub mod app_config;
pub mod config;
pub mod datastore;
pub mod http;
pub mod mapper;
pub mod metrics;
pub mod opa;
pub mod pipeline;
pub mod reload;
