use crate::{
    device::{GraphicsDevice, TextureDesc},
    HardwareError,
};
use std::time::Duration;

pub type Texture<A> = <<A as EncodeApi>::Device as GraphicsDevice>::Texture;
pub type SharedHandle<A> = <<A as EncodeApi>::Device as GraphicsDevice>::SharedHandle;

/// Session-wide encoder settings, derived from the configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderParams {
    pub width: u32,
    pub height: u32,
    pub frame_rate_numerator: u32,
    pub frame_rate_denominator: u32,
    /// Completion is reported through events rather than by blocking on the bitstream lock.
    pub async_mode: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PictureParams {
    pub frame_index: u64,
    pub width: u32,
    pub height: u32,
    /// Makes this an IDR frame preceded by SPS and PPS.
    pub force_key_frame: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BitstreamData {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
}

/// The hardware encoder's function table.
///
/// Handles are plain copyable values; the encoder guarantees that each one is destroyed exactly
/// once and never used afterwards. Completion events are owned values since some backends need to
/// release OS objects when they're destroyed.
pub trait EncodeApi {
    type Device: GraphicsDevice;
    type Session: Copy;
    type Registered: Copy;
    type Mapped: Copy;
    type Bitstream: Copy;
    type Event;

    fn open_session(&self, device: &Self::Device) -> Result<Self::Session, HardwareError>;
    fn initialize_encoder(&self, session: Self::Session, params: &EncoderParams) -> Result<(), HardwareError>;
    fn destroy_encoder(&self, session: Self::Session) -> Result<(), HardwareError>;

    fn register_resource(
        &self,
        session: Self::Session,
        texture: &<Self::Device as GraphicsDevice>::Texture,
        desc: &TextureDesc,
    ) -> Result<Self::Registered, HardwareError>;
    fn unregister_resource(&self, session: Self::Session, registered: Self::Registered) -> Result<(), HardwareError>;

    fn map_input(&self, session: Self::Session, registered: Self::Registered) -> Result<Self::Mapped, HardwareError>;
    fn unmap_input(&self, session: Self::Session, mapped: Self::Mapped) -> Result<(), HardwareError>;

    fn create_bitstream_buffer(&self, session: Self::Session) -> Result<Self::Bitstream, HardwareError>;
    fn destroy_bitstream_buffer(&self, session: Self::Session, bitstream: Self::Bitstream) -> Result<(), HardwareError>;

    fn create_event(&self, session: Self::Session) -> Result<Self::Event, HardwareError>;
    fn destroy_event(&self, session: Self::Session, event: Self::Event) -> Result<(), HardwareError>;

    /// Submits a picture. `event` is signaled once the output is available in `bitstream`.
    fn encode_picture(
        &self,
        session: Self::Session,
        mapped: Self::Mapped,
        bitstream: Self::Bitstream,
        event: &Self::Event,
        params: &PictureParams,
    ) -> Result<(), HardwareError>;

    /// Submits the end-of-stream sentinel. `event` is signaled once every earlier picture has been
    /// finalized.
    fn end_of_stream(&self, session: Self::Session, event: &Self::Event) -> Result<(), HardwareError>;

    /// Returns `Ok(false)` if the event wasn't signaled within `timeout`. A zero timeout polls.
    fn wait(&self, event: &Self::Event, timeout: Duration) -> Result<bool, HardwareError>;

    /// Locks the bitstream buffer, copies out its contents, and unlocks it.
    fn read_bitstream(&self, session: Self::Session, bitstream: Self::Bitstream) -> Result<BitstreamData, HardwareError>;
}
