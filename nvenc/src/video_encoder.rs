use crate::{
    api::{EncodeApi, Texture},
    drain::EncodedPayload,
    pipeline::RingEncoder,
    CompletionTimeoutSnafu, NvencError, PipelineSaturatedSnafu, Result,
};
use av_traits::{EncodedFrameType, EncodedVideoFrame, VideoEncoder, VideoEncoderOutput};
use log::warn;
use std::{borrow::Borrow, collections::VecDeque, time::Duration};

/// What `encode` does when every slot is in flight.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SaturationPolicy {
    /// Return `PipelineSaturated` without submitting the frame, unless polling frees a slot.
    Fail,
    /// Wait up to `timeout` for the oldest frame to complete, returning `CompletionTimeout` if it
    /// doesn't.
    Block { timeout: Duration },
}

/// Adapts a [`RingEncoder`] to the `VideoEncoder` trait. Any frame type that can be borrowed as
/// the device's texture can be encoded, and is handed back with its output.
pub struct NvencVideoEncoder<A: EncodeApi, F> {
    encoder: RingEncoder<A>,
    policy: SaturationPolicy,
    pending_frames: VecDeque<(u64, F)>,
    payloads: VecDeque<EncodedPayload>,
    flushed: bool,
}

impl<A: EncodeApi, F> NvencVideoEncoder<A, F> {
    pub fn new(encoder: RingEncoder<A>, policy: SaturationPolicy) -> Self {
        Self {
            encoder,
            policy,
            pending_frames: VecDeque::new(),
            payloads: VecDeque::new(),
            flushed: false,
        }
    }

    pub fn encoder(&self) -> &RingEncoder<A> {
        &self.encoder
    }

    pub fn policy(&self) -> SaturationPolicy {
        self.policy
    }

    /// Drains completed frames into the output queue. Frames whose output was lost are skipped,
    /// since they'll be emitted without an encoded frame.
    fn collect(&mut self, timeout: Duration) -> Result<()> {
        loop {
            let before = self.encoder.output_index();
            match self.encoder.drain_into(timeout, &mut self.payloads) {
                Ok(_) => return Ok(()),
                Err(e @ NvencError::CompletionFailed { .. }) if self.encoder.output_index() > before => {
                    warn!("dropping frame: {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Waits up to `timeout` for the oldest frame, then collects the rest without blocking.
    fn collect_oldest(&mut self, timeout: Duration) -> Result<()> {
        let before = self.encoder.output_index();
        match self.encoder.drain_oldest_into(timeout, &mut self.payloads) {
            Ok(_) => Ok(()),
            Err(e @ NvencError::CompletionFailed { .. }) if self.encoder.output_index() > before => {
                warn!("dropping frame: {e}");
                self.collect(Duration::ZERO)
            }
            Err(e) => Err(e),
        }
    }

    fn next_output(&mut self) -> Option<VideoEncoderOutput<F>> {
        let index = self.pending_frames.front()?.0;
        if index >= self.encoder.output_index() && !self.flushed {
            return None;
        }
        let (_, raw_frame) = self.pending_frames.pop_front()?;
        let encoded_frame = match self.payloads.front() {
            Some(payload) if payload.index == index => self.payloads.pop_front().map(|payload| EncodedVideoFrame {
                data: payload.data,
                is_keyframe: payload.is_keyframe,
            }),
            _ => None,
        };
        Some(VideoEncoderOutput { raw_frame, encoded_frame })
    }
}

impl<A: EncodeApi, F: Borrow<Texture<A>>> VideoEncoder for NvencVideoEncoder<A, F> {
    type Error = NvencError;
    type RawVideoFrame = F;

    fn encode(&mut self, input: F, frame_type: EncodedFrameType) -> Result<Option<VideoEncoderOutput<F>>> {
        if self.encoder.is_saturated() {
            match self.policy {
                SaturationPolicy::Fail => self.collect(Duration::ZERO)?,
                SaturationPolicy::Block { timeout } => self.collect_oldest(timeout)?,
            }
            if self.encoder.is_saturated() {
                return match self.policy {
                    SaturationPolicy::Fail => PipelineSaturatedSnafu {
                        in_flight: self.encoder.in_flight(),
                    }
                    .fail(),
                    SaturationPolicy::Block { .. } => CompletionTimeoutSnafu {
                        index: self.encoder.output_index(),
                    }
                    .fail(),
                };
            }
        }

        let frame = <F as Borrow<Texture<A>>>::borrow(&input);
        let index = self.encoder.submit(frame, frame_type == EncodedFrameType::Key)?;
        self.pending_frames.push_back((index, input));
        self.collect(Duration::ZERO)?;
        Ok(self.next_output())
    }

    fn flush(&mut self) -> Result<Option<VideoEncoderOutput<F>>> {
        if !self.flushed {
            self.flushed = true;
            self.encoder.close_into(&mut self.payloads)?;
        }
        Ok(self.next_output())
    }
}
