// ABOUTME: Library root for port-manager
// ABOUTME: Publishes upstream microservice ports through a shared proxy Workload and NetworkEndpoint

pub mod config;
pub mod error;
pub mod proxy;
pub mod ready;
pub mod reconcile;
pub mod store;
pub mod upstream;
