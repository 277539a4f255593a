//! HTTP API: router, handlers and request/response mapping over the sync engine.

pub mod app;
