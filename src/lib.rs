// Storefront auth - Library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod navigation;
pub mod runtime;
