//! Process groups for pipelined inference.

mod config;
pub use config::{ProcessGroupConfig, ProcessGroupConfigError};

mod frame;
pub use frame::{read_frame, write_frame, Frame, FrameError};

mod group;
pub use group::{LocalGroup, ProcessGroup, ProcessGroupError, TcpGroup};

mod pipeline;
pub use pipeline::{Pipeline, PipelineError};

mod store;
pub use store::StoreError;

/// Join the process group that is described by `config`.
///
/// A single process does not need communication and gets a [LocalGroup].
pub fn init_process_group(
    config: &ProcessGroupConfig,
) -> Result<Box<dyn ProcessGroup>, ProcessGroupError> {
    if config.world_size == 1 {
        log::info!("Running as a single process");
        return Ok(Box::new(LocalGroup));
    }

    log::info!(
        "Rank {} of {} joining process group at {}",
        config.rank,
        config.world_size,
        config.store_addr()
    );
    let group = TcpGroup::connect(config)?;
    log::info!("Rank {} joined process group", config.rank);

    Ok(Box::new(group))
}
