//! HTTP API Module
//!
//! Provides a REST API for follow management and the local indices.

mod http;

pub use http::{
    AckResponse, CountResponse, DocumentResponse, ErrorResponse, FollowStatsResponse,
    HealthResponse, HttpServer, IndexFollowStats, PutFollowResponse,
};
