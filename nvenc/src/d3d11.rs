use crate::{
    device::{GraphicsDevice, PixelFormat, TextureDesc},
    HardwareError,
};
use windows::{
    core::Interface,
    Win32::{
        Foundation::{E_POINTER, HANDLE},
        Graphics::{
            Direct3D11::{
                ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D, D3D11_BIND_RENDER_TARGET, D3D11_RESOURCE_MISC_SHARED,
                D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT,
            },
            Dxgi::{
                Common::{DXGI_FORMAT, DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_SAMPLE_DESC},
                IDXGIResource,
            },
        },
    },
};

fn hardware_error(e: windows::core::Error) -> HardwareError {
    HardwareError { code: e.code().0 }
}

fn dxgi_format(format: PixelFormat) -> DXGI_FORMAT {
    match format {
        PixelFormat::Rgba8 => DXGI_FORMAT_R8G8B8A8_UNORM,
        PixelFormat::Bgra8 => DXGI_FORMAT_B8G8R8A8_UNORM,
        PixelFormat::Other(format) => DXGI_FORMAT(format as _),
    }
}

fn pixel_format(format: DXGI_FORMAT) -> PixelFormat {
    match format {
        DXGI_FORMAT_R8G8B8A8_UNORM => PixelFormat::Rgba8,
        DXGI_FORMAT_B8G8R8A8_UNORM => PixelFormat::Bgra8,
        format => PixelFormat::Other(format.0 as _),
    }
}

/// A legacy DXGI shared handle. These are owned by the texture and aren't closed separately.
#[derive(Clone, Copy, Debug)]
pub struct SharedHandle(pub HANDLE);

/// A Direct3D 11 device and the immediate context that copies are queued on.
#[derive(Clone, Debug)]
pub struct D3D11Device {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
}

impl D3D11Device {
    pub fn new(device: ID3D11Device, context: ID3D11DeviceContext) -> Self {
        Self { device, context }
    }

    pub fn device(&self) -> &ID3D11Device {
        &self.device
    }
}

impl GraphicsDevice for D3D11Device {
    type Texture = ID3D11Texture2D;
    type SharedHandle = SharedHandle;

    fn create_texture(&self, desc: &TextureDesc) -> Result<ID3D11Texture2D, HardwareError> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: desc.width,
            Height: desc.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: dxgi_format(desc.format),
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: D3D11_BIND_RENDER_TARGET.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: D3D11_RESOURCE_MISC_SHARED.0 as u32,
        };
        let mut texture = None;
        unsafe { self.device.CreateTexture2D(&desc, None, Some(&mut texture)) }.map_err(hardware_error)?;
        texture.ok_or(HardwareError { code: E_POINTER.0 })
    }

    fn share_texture(&self, texture: &ID3D11Texture2D) -> Result<SharedHandle, HardwareError> {
        let resource: IDXGIResource = texture.cast().map_err(hardware_error)?;
        let handle = unsafe { resource.GetSharedHandle() }.map_err(hardware_error)?;
        Ok(SharedHandle(handle))
    }

    fn describe_texture(&self, texture: &ID3D11Texture2D) -> TextureDesc {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };
        TextureDesc {
            width: desc.Width,
            height: desc.Height,
            format: pixel_format(desc.Format),
        }
    }

    fn copy_texture(&self, source: &ID3D11Texture2D, destination: &ID3D11Texture2D) -> Result<(), HardwareError> {
        unsafe { self.context.CopyResource(destination, source) };
        Ok(())
    }
}

#[cfg(feature = "driver")]
impl crate::driver::NvEncDevice for D3D11Device {
    const DEVICE_TYPE: nvenc_sys::NV_ENC_DEVICE_TYPE = nvenc_sys::NV_ENC_DEVICE_TYPE_DIRECTX;
    const RESOURCE_TYPE: nvenc_sys::NV_ENC_INPUT_RESOURCE_TYPE = nvenc_sys::NV_ENC_INPUT_RESOURCE_TYPE_DIRECTX;

    fn as_raw(&self) -> *mut std::ffi::c_void {
        self.device.as_raw()
    }

    fn texture_as_raw(texture: &ID3D11Texture2D) -> *mut std::ffi::c_void {
        texture.as_raw()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_formats() {
        for format in [PixelFormat::Rgba8, PixelFormat::Bgra8, PixelFormat::Other(2)] {
            assert_eq!(pixel_format(dxgi_format(format)), format);
        }
    }
}

#[cfg(all(test, feature = "driver"))]
mod driver_test {
    use super::*;
    use crate::{NvencConfig, RingEncoder};
    use std::time::Duration;
    use windows::Win32::{
        Foundation::HMODULE,
        Graphics::{
            Direct3D::D3D_DRIVER_TYPE_HARDWARE,
            Direct3D11::{D3D11CreateDevice, D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_SDK_VERSION},
            Dxgi::IDXGIAdapter,
        },
    };

    fn device() -> D3D11Device {
        let mut device = None;
        let mut context = None;
        unsafe {
            D3D11CreateDevice(
                None::<&IDXGIAdapter>,
                D3D_DRIVER_TYPE_HARDWARE,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
        }
        .unwrap();
        D3D11Device::new(device.unwrap(), context.unwrap())
    }

    #[test]
    #[ignore = "requires an NVIDIA GPU"]
    fn test_encode() {
        let device = device();
        let config = NvencConfig {
            width: 640,
            height: 360,
            ..NvencConfig::new(device.clone())
        };
        let mut encoder = RingEncoder::load(config).unwrap();
        let frame = device.create_texture(&encoder.frame_desc()).unwrap();

        let mut payloads = Vec::new();
        for i in 0..30 {
            while encoder.is_saturated() {
                encoder.drain_into(Duration::from_secs(1), &mut payloads).unwrap();
            }
            encoder.submit(&frame, i % 10 == 0).unwrap();
        }
        payloads.extend(encoder.close().unwrap());

        assert_eq!(payloads.len(), 30);
        for (i, payload) in payloads.iter().enumerate() {
            assert_eq!(payload.index, i as u64);
            assert!(payload.size() > 0);
            assert_eq!(payload.is_keyframe, i % 10 == 0);
        }
        // h.264 annex b
        assert_eq!(&payloads[0].data[..3], &[0, 0, 0]);
    }
}
