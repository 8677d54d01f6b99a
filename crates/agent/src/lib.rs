//! Health predictor agent: configuration and HTTP API

pub mod api;
pub mod config;
