use std::error::Error;

/// Opaque error type used at trait and builder boundaries.
pub type BoxedError = Box<dyn Error + Send + Sync>;
