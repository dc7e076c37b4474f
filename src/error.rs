use thiserror::Error;

/// Domain errors for sample derivation and rollup configuration.
///
/// Orchestration and I/O paths use `anyhow`; this taxonomy only covers the
/// failures that have defined per-sample / per-kind handling semantics.
#[derive(Debug, Error)]
pub enum Error {
    /// A sample is missing required structural fields or has mismatched
    /// array lengths. The offending sample is dropped, never fatal.
    #[error("invalid sample data: {0}")]
    InvalidData(String),

    /// A rollup token has no implementation, or the rollup configuration
    /// for a metric kind is absent. Fatal for that kind's computation only.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
