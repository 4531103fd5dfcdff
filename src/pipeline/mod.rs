pub mod pool;
pub mod processor;
pub mod slot;

pub use pool::{BackendKind, BufferHandle, ExternalImage, FrameBufferPool, PooledBuffer};
pub use processor::{FramePipeline, FrameSubmitter, PipelineLifecycle, StopHandle, StoppedPipeline};
pub use slot::PipelineStats;
