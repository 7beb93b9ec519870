use crate::{
    api::{EncodeApi, EncoderParams, PictureParams, Texture},
    config::{fps_to_rational, NvencConfig},
    device::{GraphicsDevice, PixelFormat, TextureDesc},
    pool::Pool,
    session::Session,
    FrameFormatMismatchSnafu, NvencError, PipelineSaturatedSnafu, Result, SessionClosedSnafu,
};
use log::{debug, trace};
use snafu::{ensure, OptionExt};
use std::{sync::Arc, time::Duration};

/// Encodes GPU textures using a fixed ring of hardware resources, so that up to `pool_size` frames
/// can be encoding while the caller keeps submitting.
///
/// Frames are submitted with [`RingEncoder::submit`] and their output is collected, in submission
/// order, with [`RingEncoder::drain`]. The encoder is driven from a single thread; wrap it in a
/// `Mutex` to share it.
pub struct RingEncoder<A: EncodeApi> {
    pub(crate) inner: Option<Pool<A>>,
    pub(crate) device: A::Device,
    pub(crate) desc: TextureDesc,
    pub(crate) frame_rate: f64,
    pub(crate) pool_size: usize,
    pub(crate) input_index: u64,
    pub(crate) output_index: u64,
    pub(crate) flush_timeout: Duration,
    // an error that came up after some payloads were already collected, for the next call to report
    pub(crate) deferred_error: Option<NvencError>,
}

impl<A: EncodeApi> RingEncoder<A> {
    /// Opens a session on `config.device` and allocates its resources. Nothing is left allocated
    /// if this fails.
    pub fn new(api: A, config: NvencConfig<A::Device>) -> Result<Self> {
        config.validate()?;
        Self::open(api, config)
    }

    /// Like `new`, for a config that has already been validated.
    pub(crate) fn open(api: A, config: NvencConfig<A::Device>) -> Result<Self> {
        let (frame_rate_numerator, frame_rate_denominator) = fps_to_rational(config.frame_rate);
        let params = EncoderParams {
            width: config.width,
            height: config.height,
            frame_rate_numerator,
            frame_rate_denominator,
            async_mode: cfg!(windows),
        };
        let desc = TextureDesc {
            width: config.width,
            height: config.height,
            format: PixelFormat::Rgba8,
        };

        let session = Arc::new(Session::open(api, &config.device, &params)?);
        let pool = Pool::new(session, &config.device, &desc, config.pool_size, config.flush_timeout)?;

        Ok(Self {
            inner: Some(pool),
            device: config.device,
            desc,
            frame_rate: config.frame_rate,
            pool_size: config.pool_size,
            input_index: 0,
            output_index: 0,
            flush_timeout: config.flush_timeout,
            deferred_error: None,
        })
    }

    /// Returns true until the encoder has been closed.
    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// The description that submitted frames must match.
    pub fn frame_desc(&self) -> TextureDesc {
        self.desc
    }

    /// The number of frames submitted but not yet drained.
    pub fn in_flight(&self) -> u64 {
        self.input_index - self.output_index
    }

    /// The index that the next submitted frame will get.
    pub fn input_index(&self) -> u64 {
        self.input_index
    }

    /// The index of the next frame to be drained.
    pub fn output_index(&self) -> u64 {
        self.output_index
    }

    /// Returns true if the next submission would fail because every slot is in flight.
    pub fn is_saturated(&self) -> bool {
        self.inner.as_ref().is_some_and(|pool| pool.slot(self.input_index).is_in_flight())
    }

    /// Copies `frame` into the next slot and submits it for encoding, returning its index. This
    /// never waits for earlier frames to complete.
    pub fn submit(&mut self, frame: &Texture<A>, force_key_frame: bool) -> Result<u64> {
        let pool = self.inner.as_mut().context(SessionClosedSnafu)?;
        let index = self.input_index;

        let slot = pool.slot_mut(index);
        ensure!(
            !slot.is_in_flight(),
            PipelineSaturatedSnafu {
                in_flight: self.input_index - self.output_index
            }
        );

        let actual = self.device.describe_texture(frame);
        ensure!(actual == self.desc, FrameFormatMismatchSnafu { expected: self.desc, actual });

        let params = PictureParams {
            frame_index: index,
            width: self.desc.width,
            height: self.desc.height,
            force_key_frame,
        };
        slot.submit(&self.device, frame, &params)?;
        self.input_index += 1;

        if force_key_frame {
            debug!("submitted frame {index} as a key frame");
        } else {
            trace!("submitted frame {index}");
        }
        Ok(index)
    }
}
