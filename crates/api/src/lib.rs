//! HTTP API: operator endpoints over the batch report pipeline, plus the
//! HTTP clients for the external report and artifact services.

pub mod app;
pub mod collaborators;
