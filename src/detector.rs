//! The text detector seen from the pipeline's side

use crate::capture::Frame;
use crate::error::DetectorError;

/// Consumes preview frames one at a time.
///
/// A detector is moved into the pipeline's consumer thread and only ever
/// called from there, so it need not be `Sync`. The frame is borrowed for the
/// duration of `process`; its buffer is recycled as soon as the call returns,
/// whether it returned an error or panicked.
pub trait DetectorSink: Send + 'static {
    fn process(&mut self, frame: &Frame) -> Result<(), DetectorError>;

    /// Frees detector resources. Called exactly once, after the consumer
    /// thread has terminated.
    fn release(self);
}

impl<F> DetectorSink for F
where
    F: FnMut(&Frame) -> Result<(), DetectorError> + Send + 'static,
{
    fn process(&mut self, frame: &Frame) -> Result<(), DetectorError> {
        self(frame)
    }

    fn release(self) {}
}
