//! Aggregated error type for the external-interface functions in
//! [`crate::api`]. Lives here rather than on `duallink_core::DualLinkError`
//! because the per-category errors (`SignalingError`, `EndpointError`, ...)
//! are each defined in a crate that itself depends on `duallink-core` —
//! folding them back into `duallink-core` would be a dependency cycle, so
//! the aggregation happens at the top of the dependency graph instead, in
//! this crate, the way the teacher's own binary crates are the ones that
//! wrap `anyhow::Error` around whatever a library crate returns.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not initialized — call init() first")]
    NotInitialized,
    #[error("no active signaling session — call signaling_dial() first")]
    NoSignalingSession,
    #[error("no endpoint session for ({active_id}, {passive_id})")]
    NoEndpointSession { active_id: i64, passive_id: i64 },

    #[error("config: {0}")]
    Config(#[from] duallink_core::ConfigError),
    #[error("signaling: {0}")]
    Signaling(#[from] duallink_signaling::SignalingError),
    #[error("endpoint: {0}")]
    Endpoint(#[from] duallink_endpoint::EndpointError),
    #[error("negotiation: {0}")]
    Negotiate(#[from] duallink_negotiate::NegotiateError),
    #[error("registry: {0}")]
    Registry(#[from] duallink_registry::RegistryError),
    #[error("capture: {0}")]
    Capture(#[from] duallink_capture::CaptureError),
    #[error("codec: {0}")]
    Codec(#[from] duallink_codec::CodecError),
    #[error("input: {0}")]
    Input(#[from] duallink_input::InputError),
}
