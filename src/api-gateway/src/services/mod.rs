//! Core services for the API Gateway

pub mod circuit_breaker;
pub mod router;
