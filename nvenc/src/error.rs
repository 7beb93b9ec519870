use crate::device::TextureDesc;
use snafu::Snafu;

/// A status code returned by a backend call: an `NVENCSTATUS`, an `HRESULT` from the graphics
/// device, or whatever code a test backend chooses.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Snafu)]
#[snafu(display("hardware error code: {code}"))]
pub struct HardwareError {
    pub code: i32,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum NvencError {
    #[snafu(display("invalid configuration: {reason}"))]
    InvalidConfiguration { reason: &'static str },
    #[snafu(display("unable to load the nvenc library: {reason}"))]
    ModuleLoadFailed { reason: String },
    /// `slot` equal to the pool size refers to the end-of-stream signal.
    #[snafu(display("error {operation} for slot {slot}: {source}"))]
    ResourceAllocationFailed {
        slot: usize,
        operation: &'static str,
        source: HardwareError,
    },
    #[snafu(display("unable to open encode session: {source}"))]
    SessionOpenFailed { source: HardwareError },
    #[snafu(display("unable to initialize encoder: {source}"))]
    SessionConfigFailed { source: HardwareError },
    #[snafu(display("frame is {actual:?}, but the session expects {expected:?}"))]
    FrameFormatMismatch { expected: TextureDesc, actual: TextureDesc },
    #[snafu(display("all {in_flight} slots are still in flight"))]
    PipelineSaturated { in_flight: u64 },
    #[snafu(display("error {operation}: {source}"))]
    EncodeSubmitFailed {
        operation: &'static str,
        source: HardwareError,
    },
    #[snafu(display("error {operation} for frame {index}: {source}"))]
    CompletionFailed {
        index: u64,
        operation: &'static str,
        source: HardwareError,
    },
    #[snafu(display("frame {index} did not complete in time"))]
    CompletionTimeout { index: u64 },
    #[snafu(display("the encoder has been closed"))]
    SessionClosed,
}

pub type Result<T, E = NvencError> = core::result::Result<T, E>;
