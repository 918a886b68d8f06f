use thiserror::Error;

/// The `Config` category of the error taxonomy (spec §7): missing path,
/// corrupt file, unknown domain. Always recoverable — reported to the
/// caller, never torn down by itself.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config path not found: {path}")]
    PathNotFound { path: String },

    #[error("config file at {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("unknown domain: {domain}")]
    UnknownDomain { domain: String },

    #[error("no primary domain is configured")]
    NoPrimaryDomain,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Aggregates the per-category errors surfaced across the crate family so
/// `duallink-app`'s external-interface functions have one return type.
/// Each category is defined in the crate that owns it; this enum only
/// wraps them via `#[from]`, mirroring how the original core split
/// `DecoderError`/`TransportError` out of a single `DualLinkError`.
#[derive(Error, Debug)]
pub enum DualLinkError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("not implemented yet: {feature}")]
    NotImplemented { feature: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
