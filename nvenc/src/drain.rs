use crate::{api::EncodeApi, pipeline::RingEncoder, CompletionFailedSnafu, NvencError, Result, SessionClosedSnafu};
use log::{debug, trace, warn};
use snafu::{OptionExt, ResultExt};
use std::time::Duration;

/// A finished frame's bitstream.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EncodedPayload {
    /// The index that `RingEncoder::submit` returned for the frame.
    pub index: u64,
    pub data: Vec<u8>,
    pub is_keyframe: bool,
}

impl EncodedPayload {
    pub fn size(&self) -> u32 {
        u32::try_from(self.data.len()).unwrap_or(u32::MAX)
    }
}

impl<A: EncodeApi> RingEncoder<A> {
    /// Collects completed frames in submission order, waiting up to `timeout` for each one. This
    /// stops at the first frame that hasn't completed, so a zero timeout only polls.
    ///
    /// If a frame fails after others were already collected, those are returned and the failure is
    /// reported by the next call to `drain` or `close`.
    pub fn drain(&mut self, timeout: Duration) -> Result<Vec<EncodedPayload>> {
        if let Some(e) = self.deferred_error.take() {
            return Err(e);
        }
        let mut payloads = Vec::new();
        let result = self.drain_into(timeout, &mut payloads);
        self.deliver(payloads, result.err())
    }

    /// Like `drain`, but appends to `payloads` and returns how many were added. Payloads that were
    /// collected before an error are kept.
    ///
    /// If a frame completes but its output can't be retrieved, its output index is still consumed
    /// and `CompletionFailed` is returned, so consumers see it as a gap in the indices.
    pub fn drain_into<E: Extend<EncodedPayload>>(&mut self, timeout: Duration, payloads: &mut E) -> Result<usize> {
        let mut count = 0;
        while self.drain_next(timeout, payloads)? {
            count += 1;
        }
        Ok(count)
    }

    /// Waits up to `timeout` for the oldest frame only, then collects whatever else has already
    /// completed without waiting.
    pub fn drain_oldest_into<E: Extend<EncodedPayload>>(&mut self, timeout: Duration, payloads: &mut E) -> Result<usize> {
        if !self.drain_next(timeout, payloads)? {
            return Ok(0);
        }
        Ok(1 + self.drain_into(Duration::ZERO, payloads)?)
    }

    /// Collects the next frame in order. Returns false if nothing is in flight or the frame hasn't
    /// completed within `timeout`.
    fn drain_next<E: Extend<EncodedPayload>>(&mut self, timeout: Duration, payloads: &mut E) -> Result<bool> {
        let pool = self.inner.as_mut().context(SessionClosedSnafu)?;
        if self.output_index == self.input_index {
            return Ok(false);
        }
        let index = self.output_index;
        let slot = pool.slot_mut(index);
        let done = slot.wait(timeout).context(CompletionFailedSnafu {
            index,
            operation: "waiting for completion",
        })?;
        if !done {
            trace!("frame {index} is still encoding");
            return Ok(false);
        }

        let result = slot.finish(index);
        self.output_index += 1;
        let bitstream = result?;
        trace!("drained frame {index} ({} bytes)", bitstream.data.len());
        payloads.extend(Some(EncodedPayload {
            index,
            data: bitstream.data,
            is_keyframe: bitstream.is_keyframe,
        }));
        Ok(true)
    }

    /// Hands `payloads` back, keeping `error` for the next call unless there's nothing to return.
    fn deliver(&mut self, payloads: Vec<EncodedPayload>, error: Option<NvencError>) -> Result<Vec<EncodedPayload>> {
        match error {
            None => Ok(payloads),
            Some(e) if payloads.is_empty() => Err(e),
            Some(e) => {
                debug!("returning {} payloads and deferring error: {e}", payloads.len());
                self.deferred_error = Some(e);
                Ok(payloads)
            }
        }
    }

    /// Flushes the encoder and releases all of its resources, returning the remaining output.
    /// Closing an encoder that is already closed does nothing.
    ///
    /// Errors follow the same rules as `drain`: one that comes with payloads is reported by the
    /// next call.
    pub fn close(&mut self) -> Result<Vec<EncodedPayload>> {
        let earlier = self.deferred_error.take();
        let mut payloads = Vec::new();
        let result = self.close_into(&mut payloads);
        let error = match (earlier, result) {
            (Some(earlier), Err(e)) => {
                warn!("error closing encoder: {e}");
                Some(earlier)
            }
            (Some(earlier), Ok(_)) => Some(earlier),
            (None, result) => result.err(),
        };
        self.deliver(payloads, error)
    }

    /// Like `close`, but appends the remaining output to `payloads`. Resources are released even if
    /// this returns an error.
    pub fn close_into<E: Extend<EncodedPayload>>(&mut self, payloads: &mut E) -> Result<usize> {
        let Some(pool) = self.inner.as_mut() else {
            return Ok(0);
        };

        debug!("sending end of stream with {} frames in flight", self.input_index - self.output_index);
        let eos_sent = match pool.end_of_stream() {
            Ok(()) => true,
            Err(e) => {
                warn!("unable to send end of stream: {e}");
                false
            }
        };

        let mut count = 0;
        let mut failure = None;
        while self.output_index < self.input_index {
            let before = self.output_index;
            match self.drain_into(self.flush_timeout, &mut *payloads) {
                Ok(n) => {
                    count += n;
                    if self.output_index < self.input_index {
                        warn!("frame {} did not complete during close", self.output_index);
                        failure.get_or_insert(NvencError::CompletionTimeout { index: self.output_index });
                        break;
                    }
                }
                Err(e) => {
                    warn!("error draining during close: {e}");
                    failure.get_or_insert(e);
                    if self.output_index == before {
                        break;
                    }
                }
            }
        }

        if eos_sent {
            if let Some(pool) = self.inner.as_mut() {
                match pool.wait_end_of_stream(self.flush_timeout) {
                    Ok(true) => debug!("end of stream acknowledged"),
                    Ok(false) => warn!("end of stream was not acknowledged in time"),
                    Err(e) => warn!("unable to wait for end of stream: {e}"),
                }
            }
        }

        self.inner = None;
        debug!("closed encoder after {} frames", self.output_index);
        match failure {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }
}

impl<A: EncodeApi> Drop for RingEncoder<A> {
    fn drop(&mut self) {
        if let Some(e) = self.deferred_error.take() {
            warn!("unreported error when dropping encoder: {e}");
        }
        if self.inner.is_some() {
            let mut payloads = Vec::<EncodedPayload>::new();
            if let Err(e) = self.close_into(&mut payloads) {
                warn!("error closing encoder: {e}");
            }
            if !payloads.is_empty() {
                debug!("discarded {} payloads when dropping encoder", payloads.len());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        fake::{FakeApi, FakeDevice, Operation, Resource},
        NvencConfig,
    };

    fn encoder(api: &FakeApi, pool_size: usize) -> RingEncoder<FakeApi> {
        let config = NvencConfig {
            width: 64,
            height: 32,
            pool_size,
            flush_timeout: Duration::from_millis(10),
            ..NvencConfig::new(api.device())
        };
        RingEncoder::new(api.clone(), config).unwrap()
    }

    fn indices(payloads: &[EncodedPayload]) -> Vec<u64> {
        payloads.iter().map(|p| p.index).collect()
    }

    #[test]
    fn test_scenario() {
        let api = FakeApi::new();
        api.set_auto_complete(false);
        let mut encoder = encoder(&api, 3);
        let frames = [1, 2, 3, 4].map(|tag| api.frame(encoder.frame_desc(), tag));

        assert_eq!(encoder.submit(&frames[0], false).unwrap(), 0);
        assert_eq!(encoder.submit(&frames[1], false).unwrap(), 1);
        assert_eq!(encoder.submit(&frames[2], false).unwrap(), 2);
        assert!(matches!(
            encoder.submit(&frames[3], false),
            Err(NvencError::PipelineSaturated { in_flight: 3 })
        ));

        api.complete_next();
        let payloads = encoder.drain(Duration::ZERO).unwrap();
        assert_eq!(indices(&payloads), vec![0]);
        assert_eq!(payloads[0].data, FakeDevice::payload(1, 0));
        assert_eq!(payloads[0].size(), payloads[0].data.len() as u32);

        assert_eq!(encoder.submit(&frames[3], false).unwrap(), 3);

        api.complete_all();
        let payloads = encoder.drain(Duration::ZERO).unwrap();
        assert_eq!(indices(&payloads), vec![1, 2, 3]);
        assert_eq!(payloads[2].data, FakeDevice::payload(4, 3));
    }

    #[test]
    fn test_fifo() {
        let api = FakeApi::new();
        let mut encoder = encoder(&api, 2);
        let frame = api.frame(encoder.frame_desc(), 9);
        let mut payloads = Vec::new();
        for _ in 0..10 {
            encoder.submit(&frame, false).unwrap();
            encoder.drain_into(Duration::ZERO, &mut payloads).unwrap();
        }
        assert_eq!(indices(&payloads), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_drain_stops_at_incomplete_frame() {
        let api = FakeApi::new();
        api.set_auto_complete(false);
        let mut encoder = encoder(&api, 3);
        let frame = api.frame(encoder.frame_desc(), 1);
        encoder.submit(&frame, false).unwrap();
        encoder.submit(&frame, false).unwrap();

        // the second frame finishing first doesn't let the drain skip ahead
        api.complete(1);
        assert!(encoder.drain(Duration::ZERO).unwrap().is_empty());
        assert_eq!(encoder.output_index(), 0);

        api.complete(0);
        assert_eq!(indices(&encoder.drain(Duration::ZERO).unwrap()), vec![0, 1]);
    }

    #[test]
    fn test_drain_is_idempotent() {
        let api = FakeApi::new();
        let mut encoder = encoder(&api, 3);
        assert!(encoder.drain(Duration::from_secs(1)).unwrap().is_empty());

        let frame = api.frame(encoder.frame_desc(), 1);
        encoder.submit(&frame, false).unwrap();
        assert_eq!(encoder.drain(Duration::ZERO).unwrap().len(), 1);

        let waits = api.calls(Operation::Wait);
        assert!(encoder.drain(Duration::ZERO).unwrap().is_empty());
        assert!(encoder.drain(Duration::ZERO).unwrap().is_empty());
        assert_eq!(api.calls(Operation::Wait), waits);
        assert_eq!((encoder.input_index(), encoder.output_index()), (1, 1));
    }

    #[test]
    fn test_zero_timeout_poll() {
        let api = FakeApi::new();
        api.set_auto_complete(false);
        let mut encoder = encoder(&api, 3);
        let frame = api.frame(encoder.frame_desc(), 1);
        encoder.submit(&frame, false).unwrap();

        let start = std::time::Instant::now();
        assert!(encoder.drain(Duration::ZERO).unwrap().is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(api.last_wait_timeout(), Some(Duration::ZERO));
        assert_eq!(encoder.in_flight(), 1);
    }

    #[test]
    fn test_wait_failure_does_not_advance() {
        let api = FakeApi::new();
        let mut encoder = encoder(&api, 3);
        let frame = api.frame(encoder.frame_desc(), 1);
        encoder.submit(&frame, false).unwrap();
        api.fail_on(Operation::Wait, 0);
        assert!(matches!(
            encoder.drain(Duration::ZERO),
            Err(NvencError::CompletionFailed { index: 0, .. })
        ));
        assert_eq!(encoder.output_index(), 0);
        assert_eq!(indices(&encoder.drain(Duration::ZERO).unwrap()), vec![0]);
    }

    #[test]
    fn test_read_failure_consumes_frame() {
        let api = FakeApi::new();
        let mut encoder = encoder(&api, 3);
        let frame = api.frame(encoder.frame_desc(), 1);
        for _ in 0..3 {
            encoder.submit(&frame, false).unwrap();
        }

        api.fail_on(Operation::ReadBitstream, 1);
        let mut payloads = Vec::new();
        assert!(matches!(
            encoder.drain_into(Duration::ZERO, &mut payloads),
            Err(NvencError::CompletionFailed {
                index: 1,
                operation: "reading bitstream",
                ..
            })
        ));
        assert_eq!(indices(&payloads), vec![0]);
        assert_eq!(encoder.output_index(), 2);
        assert_eq!(api.live(Resource::Mapped), 1);

        encoder.drain_into(Duration::ZERO, &mut payloads).unwrap();
        assert_eq!(indices(&payloads), vec![0, 2]);
    }

    #[test]
    fn test_drain_defers_read_failure() {
        let api = FakeApi::new();
        let mut encoder = encoder(&api, 3);
        let frame = api.frame(encoder.frame_desc(), 1);
        encoder.submit(&frame, false).unwrap();
        encoder.submit(&frame, false).unwrap();

        api.fail_on(Operation::ReadBitstream, 1);
        assert_eq!(indices(&encoder.drain(Duration::ZERO).unwrap()), vec![0]);
        assert_eq!(encoder.output_index(), 2);
        assert!(matches!(
            encoder.drain(Duration::ZERO),
            Err(NvencError::CompletionFailed {
                index: 1,
                operation: "reading bitstream",
                ..
            })
        ));
        assert!(encoder.drain(Duration::ZERO).unwrap().is_empty());
    }

    #[test]
    fn test_drain_defers_wait_failure() {
        let api = FakeApi::new();
        let mut encoder = encoder(&api, 3);
        let frame = api.frame(encoder.frame_desc(), 1);
        encoder.submit(&frame, false).unwrap();
        encoder.submit(&frame, false).unwrap();

        api.fail_on(Operation::Wait, 1);
        assert_eq!(indices(&encoder.drain(Duration::ZERO).unwrap()), vec![0]);
        assert_eq!(encoder.output_index(), 1);
        assert!(matches!(
            encoder.drain(Duration::ZERO),
            Err(NvencError::CompletionFailed {
                index: 1,
                operation: "waiting for completion",
                ..
            })
        ));
        assert_eq!(indices(&encoder.drain(Duration::ZERO).unwrap()), vec![1]);
    }

    #[test]
    fn test_close_defers_timeout() {
        let api = FakeApi::new();
        api.set_auto_complete(false);
        api.set_hang(true);
        let mut encoder = encoder(&api, 3);
        let frame = api.frame(encoder.frame_desc(), 1);
        encoder.submit(&frame, false).unwrap();
        encoder.submit(&frame, false).unwrap();
        api.complete_next();

        assert_eq!(indices(&encoder.close().unwrap()), vec![0]);
        assert!(!encoder.is_valid());
        assert!(matches!(encoder.close(), Err(NvencError::CompletionTimeout { index: 1 })));
        assert!(encoder.close().unwrap().is_empty());
    }

    #[test]
    fn test_close_reports_deferred_drain_error() {
        let api = FakeApi::new();
        let mut encoder = encoder(&api, 3);
        let frame = api.frame(encoder.frame_desc(), 1);
        encoder.submit(&frame, false).unwrap();
        encoder.submit(&frame, false).unwrap();
        api.fail_on(Operation::ReadBitstream, 1);
        assert_eq!(encoder.drain(Duration::ZERO).unwrap().len(), 1);

        // the encoder is still closed, and the error isn't lost
        assert!(matches!(encoder.close(), Err(NvencError::CompletionFailed { index: 1, .. })));
        assert!(!encoder.is_valid());
        assert_eq!(api.total_live(), 0);
    }

    #[test]
    fn test_drain_oldest_only_blocks_on_oldest() {
        let api = FakeApi::new();
        api.set_auto_complete(false);
        let mut encoder = encoder(&api, 3);
        let frame = api.frame(encoder.frame_desc(), 1);
        for _ in 0..3 {
            encoder.submit(&frame, false).unwrap();
        }
        api.complete(0);

        let mut payloads = Vec::new();
        assert_eq!(encoder.drain_oldest_into(Duration::from_millis(500), &mut payloads).unwrap(), 1);
        assert_eq!(indices(&payloads), vec![0]);
        assert_eq!(api.wait_timeouts(), vec![Duration::from_millis(500), Duration::ZERO]);

        api.complete_all();
        assert_eq!(encoder.drain_oldest_into(Duration::ZERO, &mut payloads).unwrap(), 2);
        assert_eq!(indices(&payloads), vec![0, 1, 2]);
        assert_eq!(encoder.drain_oldest_into(Duration::ZERO, &mut payloads).unwrap(), 0);
    }

    #[test]
    fn test_close_flushes_in_flight_frames() {
        let api = FakeApi::new();
        api.set_auto_complete(false);
        let mut encoder = encoder(&api, 3);
        let frame = api.frame(encoder.frame_desc(), 1);
        encoder.submit(&frame, false).unwrap();
        encoder.submit(&frame, false).unwrap();

        // end of stream finalizes everything that is pending
        let payloads = encoder.close().unwrap();
        assert_eq!(indices(&payloads), vec![0, 1]);
        assert!(!encoder.is_valid());
        assert_eq!(api.calls(Operation::EndOfStream), 1);
        assert_eq!(api.total_live(), 0);
        assert!(api.violations().is_empty());

        assert!(encoder.close().unwrap().is_empty());
        assert!(matches!(encoder.drain(Duration::ZERO), Err(NvencError::SessionClosed)));
    }

    #[test]
    fn test_teardown_after_any_sequence() {
        for submitted in 0..=4 {
            for drained in 0..=submitted {
                let api = FakeApi::new();
                api.set_auto_complete(false);
                let mut encoder = encoder(&api, 4);
                let frame = api.frame(encoder.frame_desc(), 1);
                for _ in 0..submitted {
                    encoder.submit(&frame, false).unwrap();
                }
                for _ in 0..drained {
                    api.complete_next();
                }
                encoder.drain(Duration::ZERO).unwrap();
                drop(encoder);

                assert_eq!(api.total_live(), 0, "{submitted} submitted, {drained} drained");
                assert!(api.violations().is_empty());
                assert_eq!(api.destroyed().last(), Some(&Resource::Session));
            }
        }
    }

    #[test]
    fn test_close_with_hung_hardware() {
        let api = FakeApi::new();
        api.set_auto_complete(false);
        api.set_hang(true);
        let mut encoder = encoder(&api, 3);
        let frame = api.frame(encoder.frame_desc(), 1);
        encoder.submit(&frame, false).unwrap();
        encoder.submit(&frame, false).unwrap();
        api.complete_next();

        let mut payloads = Vec::new();
        assert!(matches!(
            encoder.close_into(&mut payloads),
            Err(NvencError::CompletionTimeout { index: 1 })
        ));
        assert_eq!(indices(&payloads), vec![0]);
        assert!(!encoder.is_valid());

        // nothing the hardware might still touch was destroyed
        assert!(api.violations().is_empty());
        assert_eq!(api.live(Resource::Session), 1);
        assert_eq!(api.live(Resource::Mapped), 1);
    }

    #[test]
    fn test_close_logs_leaked_slots() {
        let logs = crate::capture::capture();
        let api = FakeApi::new();
        api.set_auto_complete(false);
        api.set_hang(true);
        let mut encoder = encoder(&api, 2);
        let frame = api.frame(encoder.frame_desc(), 1);
        encoder.submit(&frame, false).unwrap();
        assert!(encoder.close().is_err());

        let entries = logs.entries();
        assert!(entries
            .iter()
            .any(|e| e.level == log::Level::Error && e.message == "slot 0 is still in flight, leaking its resources"));
        assert!(entries
            .iter()
            .any(|e| e.level == log::Level::Warn && e.message == "frame 0 did not complete during close"));
    }
}
