pub mod pipeline;
pub mod queue;
pub mod supervise;
pub mod watchdog;

pub use pipeline::{FramePacket, Pipeline, PipelineConfig, PipelineDeps, RunningPipeline};
pub use queue::{LossyQueue, RtQueue};
pub use supervise::{StageSupervisor, StopFlag};
pub use watchdog::Watchdog;
