use crate::HardwareError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PixelFormat {
    /// 8 bits per channel, red in the lowest byte (`DXGI_FORMAT_R8G8B8A8_UNORM`).
    Rgba8,
    /// 8 bits per channel, blue in the lowest byte (`DXGI_FORMAT_B8G8R8A8_UNORM`).
    Bgra8,
    /// Anything else, identified by the device's native format code.
    Other(u32),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// The small part of a graphics API that the encoder needs: allocating its own input textures and
/// copying caller frames into them.
pub trait GraphicsDevice {
    type Texture;

    /// A handle that lets other APIs open the texture. Released when dropped.
    type SharedHandle;

    fn create_texture(&self, desc: &TextureDesc) -> Result<Self::Texture, HardwareError>;

    fn share_texture(&self, texture: &Self::Texture) -> Result<Self::SharedHandle, HardwareError>;

    fn describe_texture(&self, texture: &Self::Texture) -> TextureDesc;

    /// Queues a GPU copy of `source` into `destination`. Both have the same description.
    fn copy_texture(&self, source: &Self::Texture, destination: &Self::Texture) -> Result<(), HardwareError>;
}
