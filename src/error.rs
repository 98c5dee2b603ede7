//! kvrt error types

use numr::dtype::DType;

/// kvrt result type
pub type Result<T> = std::result::Result<T, Error>;

/// kvrt errors
///
/// Every variant is fatal for the generation step that raised it. A cache that
/// returned an error from `advance` still holds its previous tensors, but the
/// owning session is expected to be rebuilt rather than resumed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration rejected at construction time
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of what went wrong
        reason: String,
    },

    /// A slot-name template could not be formatted
    #[error("unable to compose key value name from template '{template}': {reason}")]
    NameTemplate {
        /// The offending template
        template: String,
        /// Why formatting failed
        reason: String,
    },

    /// Element type not supported by a cache variant
    #[error("unsupported dtype {dtype:?} for {cache}")]
    UnsupportedDType {
        /// Cache variant that rejected the type
        cache: &'static str,
        /// The declared type
        dtype: DType,
    },

    /// Beam index outside `[0, rows)`
    #[error("beam index {index} at position {position} is out of range for {rows} rows")]
    BeamIndex {
        /// Position within the beam-index list
        position: usize,
        /// The offending index
        index: i32,
        /// Number of rows (batch × beam)
        rows: usize,
    },

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Staging growth would overflow the addressable size
    #[error("cannot grow staging capacity {capacity} to hold {requested} bytes")]
    CapacityOverflow {
        /// Bytes requested
        requested: usize,
        /// Capacity at the point growth failed
        capacity: usize,
    },

    /// Tensor or buffer allocation failed
    #[error("allocation of {bytes} bytes failed: {reason}")]
    Allocation {
        /// Requested size in bytes
        bytes: usize,
        /// Description of what went wrong
        reason: String,
    },

    /// Backend copy, synchronization or mapping failure
    #[error("backend error: {reason}")]
    Backend {
        /// Description of what went wrong
        reason: String,
    },

    /// Error surfaced by a numr tensor operation
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Cache lifecycle misuse
    #[error("inference error: {reason}")]
    InferenceError {
        /// Description of what went wrong
        reason: String,
    },
}
