use candle_core::Tensor;
use llama_dispatch_layers::kv_cache::KeyValueCache;
use snafu::{ensure, ResultExt, Snafu};

use super::frame::Frame;
use super::group::{ProcessGroup, ProcessGroupError};
use crate::architectures::{CausalLM, PipelineStage, StageInput, StageOutput};
use crate::error::BoxedError;

#[derive(Debug, Snafu)]
pub enum PipelineError {
    #[snafu(display("Process group error"))]
    Group { source: ProcessGroupError },

    #[snafu(display("Cannot run pipeline stage"))]
    Stage { source: BoxedError },

    #[snafu(display("Rank {rank} received unexpected {frame} frame"))]
    UnexpectedFrame { frame: String, rank: usize },

    #[snafu(display("Only rank 0 can drive the pipeline, this is rank {rank}"))]
    NotDriver { rank: usize },

    #[snafu(display("Rank 0 drives the pipeline and cannot serve"))]
    Driver,

    #[snafu(display("Stage of a single-process pipeline must compute logits"))]
    MissingLogits,
}

/// Pipeline of model stages over the ranks of a process group.
///
/// Rank 0 drives the pipeline: it embeds the pieces, runs its layers and
/// sends hidden representations to the next rank. The last rank sends the
/// logits of the last position back to rank 0. Control frames travel the
/// whole ring, so that rank 0 knows when every rank has processed them.
pub struct Pipeline {
    stage: Box<dyn PipelineStage>,
    cache: KeyValueCache,
    group: Box<dyn ProcessGroup>,
}

impl Pipeline {
    pub fn new(stage: Box<dyn PipelineStage>, group: Box<dyn ProcessGroup>) -> Self {
        let cache = stage.new_cache();
        Pipeline {
            stage,
            cache,
            group,
        }
    }

    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    /// Wait until all ranks have reached the barrier.
    pub fn barrier(&mut self) -> Result<(), PipelineError> {
        self.group.barrier().context(GroupSnafu)
    }

    /// Process frames from the previous rank until a stop frame is received.
    pub fn serve(&mut self) -> Result<(), PipelineError> {
        let rank = self.rank();
        ensure!(rank != 0, DriverSnafu);

        loop {
            let frame = self.group.recv_prev().context(GroupSnafu)?;
            log::trace!("Rank {rank} received {} frame", frame.name());
            let reply = match frame {
                Frame::Hidden { index_pos, hidden } => {
                    let output = self
                        .stage
                        .forward(StageInput::Hidden(hidden), index_pos, &mut self.cache)
                        .context(StageSnafu)?;
                    match output {
                        StageOutput::Hidden(hidden) => Frame::Hidden { index_pos, hidden },
                        StageOutput::Logits(logits) => Frame::Logits { logits },
                    }
                }
                Frame::Reset => {
                    self.cache.reset();
                    Frame::Reset
                }
                Frame::Barrier => Frame::Barrier,
                Frame::Stop => {
                    self.group.send_next(&Frame::Stop).context(GroupSnafu)?;
                    log::info!("Rank {rank} stopped serving");
                    return Ok(());
                }
                Frame::Logits { .. } => {
                    return UnexpectedFrameSnafu {
                        frame: "logits",
                        rank,
                    }
                    .fail()
                }
            };
            self.group.send_next(&reply).context(GroupSnafu)?;
        }
    }

    /// Stop the serving ranks.
    pub fn shutdown(&mut self) -> Result<(), PipelineError> {
        self.round_trip(Frame::Stop)
    }

    fn round_trip(&mut self, frame: Frame) -> Result<(), PipelineError> {
        let rank = self.rank();
        ensure!(rank == 0, NotDriverSnafu { rank });
        if self.world_size() == 1 {
            return Ok(());
        }

        let expected = frame.name();
        self.group.send_next(&frame).context(GroupSnafu)?;
        let reply = self.group.recv_prev().context(GroupSnafu)?;
        ensure!(
            reply.name() == expected,
            UnexpectedFrameSnafu {
                frame: reply.name(),
                rank
            }
        );

        Ok(())
    }

    fn reset_cache(&mut self) -> Result<(), PipelineError> {
        self.cache.reset();
        self.round_trip(Frame::Reset)
    }

    fn logits(&mut self, piece_ids: &Tensor, index_pos: usize) -> Result<Tensor, PipelineError> {
        let rank = self.rank();
        ensure!(rank == 0, NotDriverSnafu { rank });

        let output = self
            .stage
            .forward(StageInput::Pieces(piece_ids.clone()), index_pos, &mut self.cache)
            .context(StageSnafu)?;
        let hidden = match output {
            StageOutput::Logits(logits) => return Ok(logits),
            StageOutput::Hidden(_) if self.world_size() == 1 => return MissingLogitsSnafu.fail(),
            StageOutput::Hidden(hidden) => hidden,
        };

        self.group
            .send_next(&Frame::Hidden { index_pos, hidden })
            .context(GroupSnafu)?;
        match self.group.recv_prev().context(GroupSnafu)? {
            Frame::Logits { logits } => Ok(logits),
            frame => UnexpectedFrameSnafu {
                frame: frame.name(),
                rank,
            }
            .fail(),
        }
    }
}

impl CausalLM for Pipeline {
    fn reset(&mut self) -> Result<(), BoxedError> {
        Ok(self.reset_cache()?)
    }

    fn last_logits(&mut self, piece_ids: &Tensor, index_pos: usize) -> Result<Tensor, BoxedError> {
        Ok(self.logits(piece_ids, index_pos)?)
    }
}
