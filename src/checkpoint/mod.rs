//! Checkpoint files and parameter naming.

mod layout;
pub use layout::{CheckpointLayout, CheckpointLayoutError};

mod naming;
pub use naming::{ParameterNaming, ParameterNamingError};

mod weights;
pub use weights::{Checkpoint, CheckpointError, WeightFiles};
