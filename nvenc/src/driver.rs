use crate::{
    api::{BitstreamData, EncodeApi, EncoderParams, PictureParams},
    config::NvencConfig,
    device::{GraphicsDevice, PixelFormat, TextureDesc},
    pipeline::RingEncoder,
    HardwareError, ModuleLoadFailedSnafu, Result,
};
use log::{debug, warn};
use nvenc_sys as sys;
use snafu::ensure;
use std::{
    ffi::{c_void, CStr, OsStr},
    marker::PhantomData,
    ptr, slice,
    time::Duration,
};

/// A graphics device that NVENC can open a session on.
pub trait NvEncDevice: GraphicsDevice {
    const DEVICE_TYPE: sys::NV_ENC_DEVICE_TYPE;
    const RESOURCE_TYPE: sys::NV_ENC_INPUT_RESOURCE_TYPE;

    fn as_raw(&self) -> *mut c_void;
    fn texture_as_raw(texture: &Self::Texture) -> *mut c_void;
}

/// An opaque NVENC handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Handle(*mut c_void);

// SAFETY: NVENC handles can be used from any thread as long as calls on a session aren't made
// concurrently. Every call that uses one goes through `&mut RingEncoder`, so shared references
// never race.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MappedInput {
    resource: Handle,
    format: sys::NV_ENC_BUFFER_FORMAT,
}

/// The NVENC function table, loaded from the driver's shared library.
pub struct NvEncDriver<D> {
    functions: Box<sys::NV_ENCODE_API_FUNCTION_LIST>,
    _lib: sys::nvenc_api,
    _device: PhantomData<fn() -> D>,
}

// SAFETY: the function table is never modified after it's loaded.
unsafe impl<D> Send for NvEncDriver<D> {}
unsafe impl<D> Sync for NvEncDriver<D> {}

fn check(operation: &str, status: sys::NVENCSTATUS) -> Result<(), HardwareError> {
    match status {
        sys::NV_ENC_SUCCESS => Ok(()),
        code => {
            debug!("{operation} failed: {}", sys::status_name(code));
            Err(HardwareError { code: code as i32 })
        }
    }
}

fn buffer_format(format: PixelFormat) -> Result<sys::NV_ENC_BUFFER_FORMAT, HardwareError> {
    match format {
        PixelFormat::Rgba8 => Ok(sys::NV_ENC_BUFFER_FORMAT_ABGR),
        PixelFormat::Bgra8 => Ok(sys::NV_ENC_BUFFER_FORMAT_ARGB),
        PixelFormat::Other(_) => Err(HardwareError {
            code: sys::NV_ENC_ERR_UNSUPPORTED_PARAM as i32,
        }),
    }
}

macro_rules! function {
    ($self:ident.$name:ident) => {
        $self.functions.$name.ok_or(HardwareError {
            code: sys::NV_ENC_ERR_UNIMPLEMENTED as i32,
        })?
    };
}

impl<D> NvEncDriver<D> {
    /// Loads the driver's encode library from its usual location.
    pub fn load() -> Result<Self> {
        Self::load_from(sys::DEFAULT_LIBRARY_NAME)
    }

    pub fn load_from<P: AsRef<OsStr>>(path: P) -> Result<Self> {
        let lib = unsafe { sys::nvenc_api::new(path) }.map_err(|e| crate::NvencError::ModuleLoadFailed { reason: e.to_string() })?;

        let mut version = 0;
        let status = unsafe { lib.NvEncodeAPIGetMaxSupportedVersion(&mut version) };
        ensure!(
            status == sys::NV_ENC_SUCCESS,
            ModuleLoadFailedSnafu {
                reason: format!("unable to query the supported api version: {}", sys::status_name(status)),
            }
        );
        let required = (sys::NVENCAPI_MAJOR_VERSION << 4) | sys::NVENCAPI_MINOR_VERSION;
        ensure!(
            version >= required,
            ModuleLoadFailedSnafu {
                reason: format!(
                    "the driver supports api version {}.{}, but {}.{} is required",
                    version >> 4,
                    version & 0xf,
                    sys::NVENCAPI_MAJOR_VERSION,
                    sys::NVENCAPI_MINOR_VERSION
                ),
            }
        );

        let mut functions = Box::<sys::NV_ENCODE_API_FUNCTION_LIST>::default();
        functions.version = sys::NV_ENCODE_API_FUNCTION_LIST_VER;
        let status = unsafe { lib.NvEncodeAPICreateInstance(&mut *functions) };
        ensure!(
            status == sys::NV_ENC_SUCCESS,
            ModuleLoadFailedSnafu {
                reason: format!("unable to create an api instance: {}", sys::status_name(status)),
            }
        );

        debug!("loaded nvenc (driver supports api version {}.{})", version >> 4, version & 0xf);
        Ok(Self {
            functions,
            _lib: lib,
            _device: PhantomData,
        })
    }

    /// Like `check`, but also logs the session's description of the error.
    fn check_session(&self, session: Handle, operation: &str, status: sys::NVENCSTATUS) -> Result<(), HardwareError> {
        if status != sys::NV_ENC_SUCCESS {
            if let Some(get_last_error) = self.functions.nvEncGetLastErrorString {
                let message = unsafe { get_last_error(session.0) };
                if !message.is_null() {
                    let message = unsafe { CStr::from_ptr(message) };
                    debug!("{operation}: {}", message.to_string_lossy());
                }
            }
        }
        check(operation, status)
    }
}

impl<D: NvEncDevice> RingEncoder<NvEncDriver<D>> {
    /// Loads the driver's encode library and opens a session with it.
    pub fn load(config: NvencConfig<D>) -> Result<Self> {
        config.validate()?;
        Self::open(NvEncDriver::load()?, config)
    }
}

impl<D: NvEncDevice> EncodeApi for NvEncDriver<D> {
    type Device = D;
    type Session = Handle;
    type Registered = Handle;
    type Mapped = MappedInput;
    type Bitstream = Handle;
    type Event = event::CompletionEvent;

    fn open_session(&self, device: &D) -> Result<Handle, HardwareError> {
        let open = function!(self.nvEncOpenEncodeSessionEx);
        let mut params = sys::NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS {
            version: sys::NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS_VER,
            deviceType: D::DEVICE_TYPE,
            device: device.as_raw(),
            apiVersion: sys::NVENCAPI_VERSION,
            ..Default::default()
        };
        let mut encoder = ptr::null_mut();
        let status = unsafe { open(&mut params, &mut encoder) };
        if status != sys::NV_ENC_SUCCESS && !encoder.is_null() {
            // A failed open can still allocate an encoder that needs to be destroyed.
            if let Err(e) = self.destroy_encoder(Handle(encoder)) {
                warn!("unable to destroy encoder after failed open: {e}");
            }
        }
        check("opening encode session", status)?;
        Ok(Handle(encoder))
    }

    fn initialize_encoder(&self, session: Handle, params: &EncoderParams) -> Result<(), HardwareError> {
        let initialize = function!(self.nvEncInitializeEncoder);
        let mut params = sys::NV_ENC_INITIALIZE_PARAMS {
            version: sys::NV_ENC_INITIALIZE_PARAMS_VER,
            encodeGUID: sys::NV_ENC_CODEC_H264_GUID,
            presetGUID: sys::NV_ENC_PRESET_P4_GUID,
            encodeWidth: params.width,
            encodeHeight: params.height,
            darWidth: params.width,
            darHeight: params.height,
            frameRateNum: params.frame_rate_numerator,
            frameRateDen: params.frame_rate_denominator,
            enableEncodeAsync: params.async_mode as u32,
            enablePTD: 1,
            maxEncodeWidth: params.width,
            maxEncodeHeight: params.height,
            tuningInfo: sys::NV_ENC_TUNING_INFO_LOW_LATENCY,
            ..Default::default()
        };
        let status = unsafe { initialize(session.0, &mut params) };
        self.check_session(session, "initializing encoder", status)
    }

    fn destroy_encoder(&self, session: Handle) -> Result<(), HardwareError> {
        let destroy = function!(self.nvEncDestroyEncoder);
        check("destroying encoder", unsafe { destroy(session.0) })
    }

    fn register_resource(&self, session: Handle, texture: &D::Texture, desc: &TextureDesc) -> Result<Handle, HardwareError> {
        let register = function!(self.nvEncRegisterResource);
        let mut params = sys::NV_ENC_REGISTER_RESOURCE {
            version: sys::NV_ENC_REGISTER_RESOURCE_VER,
            resourceType: D::RESOURCE_TYPE,
            width: desc.width,
            height: desc.height,
            resourceToRegister: D::texture_as_raw(texture),
            bufferFormat: buffer_format(desc.format)?,
            bufferUsage: sys::NV_ENC_INPUT_IMAGE,
            ..Default::default()
        };
        let status = unsafe { register(session.0, &mut params) };
        self.check_session(session, "registering resource", status)?;
        Ok(Handle(params.registeredResource))
    }

    fn unregister_resource(&self, session: Handle, registered: Handle) -> Result<(), HardwareError> {
        let unregister = function!(self.nvEncUnregisterResource);
        let status = unsafe { unregister(session.0, registered.0) };
        self.check_session(session, "unregistering resource", status)
    }

    fn map_input(&self, session: Handle, registered: Handle) -> Result<MappedInput, HardwareError> {
        let map = function!(self.nvEncMapInputResource);
        let mut params = sys::NV_ENC_MAP_INPUT_RESOURCE {
            version: sys::NV_ENC_MAP_INPUT_RESOURCE_VER,
            registeredResource: registered.0,
            ..Default::default()
        };
        let status = unsafe { map(session.0, &mut params) };
        self.check_session(session, "mapping input", status)?;
        Ok(MappedInput {
            resource: Handle(params.mappedResource),
            format: params.mappedBufferFmt,
        })
    }

    fn unmap_input(&self, session: Handle, mapped: MappedInput) -> Result<(), HardwareError> {
        let unmap = function!(self.nvEncUnmapInputResource);
        let status = unsafe { unmap(session.0, mapped.resource.0) };
        self.check_session(session, "unmapping input", status)
    }

    fn create_bitstream_buffer(&self, session: Handle) -> Result<Handle, HardwareError> {
        let create = function!(self.nvEncCreateBitstreamBuffer);
        let mut params = sys::NV_ENC_CREATE_BITSTREAM_BUFFER {
            version: sys::NV_ENC_CREATE_BITSTREAM_BUFFER_VER,
            ..Default::default()
        };
        let status = unsafe { create(session.0, &mut params) };
        self.check_session(session, "creating bitstream buffer", status)?;
        Ok(Handle(params.bitstreamBuffer))
    }

    fn destroy_bitstream_buffer(&self, session: Handle, bitstream: Handle) -> Result<(), HardwareError> {
        let destroy = function!(self.nvEncDestroyBitstreamBuffer);
        let status = unsafe { destroy(session.0, bitstream.0) };
        self.check_session(session, "destroying bitstream buffer", status)
    }

    fn create_event(&self, session: Handle) -> Result<event::CompletionEvent, HardwareError> {
        let event = event::CompletionEvent::new()?;
        if event::ASYNC {
            let register = function!(self.nvEncRegisterAsyncEvent);
            let mut params = sys::NV_ENC_EVENT_PARAMS {
                version: sys::NV_ENC_EVENT_PARAMS_VER,
                completionEvent: event.as_raw(),
                ..Default::default()
            };
            let status = unsafe { register(session.0, &mut params) };
            self.check_session(session, "registering completion event", status)?;
        }
        Ok(event)
    }

    fn destroy_event(&self, session: Handle, event: event::CompletionEvent) -> Result<(), HardwareError> {
        if event::ASYNC {
            let unregister = function!(self.nvEncUnregisterAsyncEvent);
            let mut params = sys::NV_ENC_EVENT_PARAMS {
                version: sys::NV_ENC_EVENT_PARAMS_VER,
                completionEvent: event.as_raw(),
                ..Default::default()
            };
            let status = unsafe { unregister(session.0, &mut params) };
            self.check_session(session, "unregistering completion event", status)?;
        }
        drop(event);
        Ok(())
    }

    fn encode_picture(
        &self,
        session: Handle,
        mapped: MappedInput,
        bitstream: Handle,
        event: &event::CompletionEvent,
        params: &PictureParams,
    ) -> Result<(), HardwareError> {
        let encode = function!(self.nvEncEncodePicture);
        let mut flags = 0;
        if params.force_key_frame {
            flags |= (sys::NV_ENC_PIC_FLAG_FORCEIDR | sys::NV_ENC_PIC_FLAG_OUTPUT_SPSPPS) as u32;
        }
        let mut picture = sys::NV_ENC_PIC_PARAMS {
            version: sys::NV_ENC_PIC_PARAMS_VER,
            inputWidth: params.width,
            inputHeight: params.height,
            inputPitch: params.width,
            encodePicFlags: flags,
            frameIdx: params.frame_index as u32,
            inputTimeStamp: params.frame_index,
            inputBuffer: mapped.resource.0,
            outputBitstream: bitstream.0,
            completionEvent: event.as_raw(),
            bufferFmt: mapped.format,
            pictureStruct: sys::NV_ENC_PIC_STRUCT_FRAME,
            ..Default::default()
        };
        match unsafe { encode(session.0, &mut picture) } {
            // Only reported when the encoder buffers frames for reordering.
            sys::NV_ENC_ERR_NEED_MORE_INPUT => Ok(()),
            status => self.check_session(session, "encoding picture", status),
        }
    }

    fn end_of_stream(&self, session: Handle, event: &event::CompletionEvent) -> Result<(), HardwareError> {
        let encode = function!(self.nvEncEncodePicture);
        let mut picture = sys::NV_ENC_PIC_PARAMS {
            version: sys::NV_ENC_PIC_PARAMS_VER,
            encodePicFlags: sys::NV_ENC_PIC_FLAG_EOS as u32,
            completionEvent: event.as_raw(),
            ..Default::default()
        };
        let status = unsafe { encode(session.0, &mut picture) };
        self.check_session(session, "sending end of stream", status)
    }

    fn wait(&self, event: &event::CompletionEvent, timeout: Duration) -> Result<bool, HardwareError> {
        event.wait(timeout)
    }

    fn read_bitstream(&self, session: Handle, bitstream: Handle) -> Result<BitstreamData, HardwareError> {
        let lock = function!(self.nvEncLockBitstream);
        let unlock = function!(self.nvEncUnlockBitstream);
        let mut params = sys::NV_ENC_LOCK_BITSTREAM {
            version: sys::NV_ENC_LOCK_BITSTREAM_VER,
            outputBitstream: bitstream.0,
            ..Default::default()
        };
        let status = unsafe { lock(session.0, &mut params) };
        self.check_session(session, "locking bitstream", status)?;

        let data = if params.bitstreamBufferPtr.is_null() {
            Vec::new()
        } else {
            unsafe { slice::from_raw_parts(params.bitstreamBufferPtr as *const u8, params.bitstreamSizeInBytes as usize) }.to_vec()
        };
        let is_keyframe = matches!(params.pictureType, sys::NV_ENC_PIC_TYPE_IDR | sys::NV_ENC_PIC_TYPE_I);

        let status = unsafe { unlock(session.0, bitstream.0) };
        self.check_session(session, "unlocking bitstream", status)?;
        Ok(BitstreamData { data, is_keyframe })
    }
}

/// Completion events. NVENC only runs asynchronously on Windows, where completion is reported
/// through Win32 events. Elsewhere, locking the bitstream blocks until the frame is done, so every
/// event is always signaled.
#[cfg(windows)]
pub mod event {
    use crate::HardwareError;
    use std::{ffi::c_void, time::Duration};
    use windows::{
        core::PCWSTR,
        Win32::{
            Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT},
            System::Threading::{CreateEventW, WaitForSingleObject},
        },
    };

    pub(crate) const ASYNC: bool = true;

    #[derive(Debug)]
    pub struct CompletionEvent(HANDLE);

    // SAFETY: Win32 event handles can be used from any thread.
    unsafe impl Send for CompletionEvent {}

    impl CompletionEvent {
        pub(crate) fn new() -> Result<Self, HardwareError> {
            let handle = unsafe { CreateEventW(None, false, false, PCWSTR::null()) }.map_err(|e| HardwareError { code: e.code().0 })?;
            Ok(Self(handle))
        }

        pub(crate) fn as_raw(&self) -> *mut c_void {
            self.0 .0
        }

        pub(crate) fn wait(&self, timeout: Duration) -> Result<bool, HardwareError> {
            // INFINITE is u32::MAX, so stay just below it.
            let milliseconds = timeout.as_millis().min(u32::MAX as u128 - 1) as u32;
            match unsafe { WaitForSingleObject(self.0, milliseconds) } {
                WAIT_OBJECT_0 => Ok(true),
                WAIT_TIMEOUT => Ok(false),
                _ => Err(HardwareError {
                    code: windows::core::Error::from_win32().code().0,
                }),
            }
        }
    }

    impl Drop for CompletionEvent {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

#[cfg(not(windows))]
pub mod event {
    use crate::HardwareError;
    use std::{ffi::c_void, ptr, time::Duration};

    pub(crate) const ASYNC: bool = false;

    #[derive(Debug)]
    pub struct CompletionEvent(());

    impl CompletionEvent {
        pub(crate) fn new() -> Result<Self, HardwareError> {
            Ok(Self(()))
        }

        pub(crate) fn as_raw(&self) -> *mut c_void {
            ptr::null_mut()
        }

        pub(crate) fn wait(&self, _timeout: Duration) -> Result<bool, HardwareError> {
            Ok(true)
        }
    }
}
