use alloc::vec::Vec;

/// Requests a particular kind of frame from the encoder.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EncodedFrameType {
    /// Let the encoder decide.
    #[default]
    Auto,
    /// Force a self-contained key frame, e.g. so that a new viewer can start decoding.
    Key,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EncodedVideoFrame {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
}

pub struct VideoEncoderOutput<F> {
    /// The frame that was given to the encoder.
    pub raw_frame: F,

    /// The encoded frame, or `None` if the encoder dropped it.
    pub encoded_frame: Option<EncodedVideoFrame>,
}

/// Implements basic video encoding behavior. The raw frame is handed back alongside its encoded
/// output so that callers can carry arbitrary per-frame context through the encoder.
///
/// Typical usage should look like this:
///
/// ```
/// # use av_traits::{EncodedFrameType, VideoEncoder};
/// fn encode<S, E>(mut source: S, mut encoder: E) -> Result<(), E::Error>
///     where S: Iterator<Item = E::RawVideoFrame>,
///     E: VideoEncoder,
/// {
///     while let Some(frame) = source.next() {
///         if let Some(output) = encoder.encode(frame, EncodedFrameType::Auto)? {
///             // do something with output
///         }
///     }
///
///     while let Some(output) = encoder.flush()? {
///         // do something with output
///     }
///
///     Ok(())
/// }
/// ```
pub trait VideoEncoder {
    type Error;
    type RawVideoFrame;

    /// Sends a frame to the encoder. This may block while the encoder performs encoding.
    ///
    /// `None` may be returned at the start of a session to allow for delayed encoder output (e.g.
    /// for pipelined hardware or lookahead RC).
    ///
    /// Because output may be delayed, the returned frame is not necessarily the same as the input
    /// frame.
    fn encode(&mut self, input: Self::RawVideoFrame, frame_type: EncodedFrameType) -> Result<Option<VideoEncoderOutput<Self::RawVideoFrame>>, Self::Error>;

    /// Indicates to the encoder that no more input will be provided and it should emit any delayed
    /// frames. This should be invoked until no more frames are returned.
    fn flush(&mut self) -> Result<Option<VideoEncoderOutput<Self::RawVideoFrame>>, Self::Error>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_video_encoder_object_safety() {
        let _e: *const dyn VideoEncoder<Error = (), RawVideoFrame = ()>;
    }

    #[test]
    fn test_default_frame_type() {
        assert_eq!(EncodedFrameType::default(), EncodedFrameType::Auto);
    }
}
