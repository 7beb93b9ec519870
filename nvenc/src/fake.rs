//! A scripted in-memory encoder for tests.
//!
//! [`FakeApi`] and the [`FakeDevice`] it hands out share one state, which records every handle
//! that is alive, the order in which handles were destroyed, and any handle that was destroyed
//! while the "hardware" could still be writing to it. Completion is either immediate or driven
//! manually with [`FakeApi::complete_next`] and friends, and any operation can be made to fail.
//!
//! Waits block like the real thing, so completions can come from another thread.

use crate::{
    api::{BitstreamData, EncodeApi, EncoderParams, PictureParams},
    device::{GraphicsDevice, TextureDesc},
    HardwareError,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// The code returned by injected failures.
pub const FAKE_ERROR_CODE: i32 = -1;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operation {
    CreateTexture,
    ShareTexture,
    CopyTexture,
    OpenSession,
    InitializeEncoder,
    RegisterResource,
    MapInput,
    UnmapInput,
    CreateBitstreamBuffer,
    CreateEvent,
    EncodePicture,
    EndOfStream,
    Wait,
    ReadBitstream,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Resource {
    Texture,
    SharedHandle,
    Session,
    Registered,
    Mapped,
    Bitstream,
    Event,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FakeHandle(u64);

#[derive(Debug)]
pub struct FakeEvent(u64);

#[derive(Debug)]
struct Encode {
    frame_index: u64,
    event: u64,
    bitstream: u64,
    mapped: u64,
    output: BitstreamData,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    manual_completion: bool,
    hang: bool,
    failures: Vec<(Operation, usize)>,
    calls: HashMap<Operation, usize>,
    live: HashMap<Resource, usize>,
    destroyed: Vec<Resource>,
    violations: Vec<String>,
    encoder_params: Option<EncoderParams>,
    wait_timeouts: Vec<Duration>,

    // texture id -> tag of the frame it holds
    contents: HashMap<u64, u8>,
    // registered id -> texture id
    registrations: HashMap<u64, u64>,
    // mapped id -> registered id
    mappings: HashMap<u64, u64>,
    bitstreams: HashMap<u64, BitstreamData>,
    signaled: HashSet<u64>,
    pending: VecDeque<Encode>,
    eos_event: Option<u64>,
}

impl State {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Counts the call and fails it if a failure was scheduled for it.
    fn call(&mut self, operation: Operation) -> Result<(), HardwareError> {
        *self.calls.entry(operation).or_default() += 1;
        let mut fail = false;
        self.failures.retain_mut(|(op, remaining)| {
            if *op != operation || fail {
                return true;
            }
            if *remaining == 0 {
                fail = true;
                return false;
            }
            *remaining -= 1;
            true
        });
        if fail {
            Err(HardwareError { code: FAKE_ERROR_CODE })
        } else {
            Ok(())
        }
    }

    fn create(&mut self, resource: Resource) -> u64 {
        *self.live.entry(resource).or_default() += 1;
        self.id()
    }

    fn destroy(&mut self, resource: Resource) {
        match self.live.get_mut(&resource) {
            Some(n) if *n > 0 => *n -= 1,
            _ => self.violations.push(format!("{resource:?} destroyed more times than it was created")),
        }
        self.destroyed.push(resource);
    }

    fn check_idle(&mut self, what: &str, matches: impl Fn(&Encode) -> bool) {
        if self.pending.iter().any(matches) {
            self.violations.push(format!("{what} released while its encode was pending"));
        }
    }

    fn complete(&mut self, position: usize) -> bool {
        match self.pending.remove(position) {
            Some(encode) => {
                self.bitstreams.insert(encode.bitstream, encode.output);
                self.signaled.insert(encode.event);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    // notified whenever an event is signaled
    completed: Condvar,
}

fn lock(shared: &Shared) -> MutexGuard<'_, State> {
    shared.state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A texture is just an id. Textures created by the encoder count as live resources while frames
/// made with [`FakeApi::frame`] don't.
#[derive(Debug)]
pub struct FakeTexture {
    id: u64,
    desc: TextureDesc,
    owned: bool,
    state: Arc<Shared>,
}

impl Drop for FakeTexture {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.contents.remove(&self.id);
        if self.owned {
            let id = self.id;
            let registered = state
                .registrations
                .iter()
                .filter(|(_, texture)| **texture == id)
                .map(|(registered, _)| *registered)
                .collect::<Vec<_>>();
            let mapped = state
                .mappings
                .iter()
                .filter(|(_, r)| registered.contains(r))
                .map(|(mapped, _)| *mapped)
                .collect::<Vec<_>>();
            state.check_idle("texture", |encode| mapped.contains(&encode.mapped));
            state.destroy(Resource::Texture);
        }
    }
}

#[derive(Debug)]
pub struct FakeSharedHandle {
    state: Arc<Shared>,
}

impl Drop for FakeSharedHandle {
    fn drop(&mut self) {
        lock(&self.state).destroy(Resource::SharedHandle);
    }
}

#[derive(Clone)]
pub struct FakeDevice {
    state: Arc<Shared>,
}

impl std::fmt::Debug for FakeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeDevice").finish_non_exhaustive()
    }
}

impl FakeDevice {
    /// The bitstream that encoding a frame with the given tag produces.
    pub fn payload(tag: u8, frame_index: u64) -> Vec<u8> {
        let mut data = vec![0, 0, 0, 1, tag];
        data.extend_from_slice(&frame_index.to_be_bytes());
        data
    }
}

impl GraphicsDevice for FakeDevice {
    type Texture = FakeTexture;
    type SharedHandle = FakeSharedHandle;

    fn create_texture(&self, desc: &TextureDesc) -> Result<FakeTexture, HardwareError> {
        let mut state = lock(&self.state);
        state.call(Operation::CreateTexture)?;
        let id = state.create(Resource::Texture);
        Ok(FakeTexture {
            id,
            desc: *desc,
            owned: true,
            state: self.state.clone(),
        })
    }

    fn share_texture(&self, _texture: &FakeTexture) -> Result<FakeSharedHandle, HardwareError> {
        let mut state = lock(&self.state);
        state.call(Operation::ShareTexture)?;
        state.create(Resource::SharedHandle);
        Ok(FakeSharedHandle { state: self.state.clone() })
    }

    fn describe_texture(&self, texture: &FakeTexture) -> TextureDesc {
        texture.desc
    }

    fn copy_texture(&self, source: &FakeTexture, destination: &FakeTexture) -> Result<(), HardwareError> {
        let mut state = lock(&self.state);
        state.call(Operation::CopyTexture)?;
        let tag = state.contents.get(&source.id).copied().unwrap_or_default();
        state.contents.insert(destination.id, tag);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeApi {
    state: Arc<Shared>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(&self) -> FakeDevice {
        FakeDevice { state: self.state.clone() }
    }

    /// Creates a caller frame whose encoded output will be `FakeDevice::payload(tag, index)`.
    pub fn frame(&self, desc: TextureDesc, tag: u8) -> FakeTexture {
        let mut state = lock(&self.state);
        let id = state.id();
        state.contents.insert(id, tag);
        FakeTexture {
            id,
            desc,
            owned: false,
            state: self.state.clone(),
        }
    }

    /// By default, encodes complete as soon as they're submitted.
    pub fn set_auto_complete(&self, auto_complete: bool) {
        lock(&self.state).manual_completion = !auto_complete;
    }

    /// Makes end of stream leave pending encodes pending, as if the hardware stopped responding.
    pub fn set_hang(&self, hang: bool) {
        lock(&self.state).hang = hang;
    }

    /// Makes the `nth` call of `operation` from now on fail, counting from zero.
    pub fn fail_on(&self, operation: Operation, nth: usize) {
        lock(&self.state).failures.push((operation, nth));
    }

    /// Completes the oldest pending encode. Returns false if nothing is pending.
    pub fn complete_next(&self) -> bool {
        let completed = lock(&self.state).complete(0);
        self.state.completed.notify_all();
        completed
    }

    /// Completes the pending encode for the given frame index, regardless of submission order.
    pub fn complete(&self, frame_index: u64) -> bool {
        let completed = {
            let mut state = lock(&self.state);
            match state.pending.iter().position(|encode| encode.frame_index == frame_index) {
                Some(position) => state.complete(position),
                None => false,
            }
        };
        self.state.completed.notify_all();
        completed
    }

    pub fn complete_all(&self) {
        let mut state = lock(&self.state);
        while state.complete(0) {}
        self.state.completed.notify_all();
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn calls(&self, operation: Operation) -> usize {
        lock(&self.state).calls.get(&operation).copied().unwrap_or_default()
    }

    pub fn live(&self, resource: Resource) -> usize {
        lock(&self.state).live.get(&resource).copied().unwrap_or_default()
    }

    pub fn total_live(&self) -> usize {
        lock(&self.state).live.values().sum()
    }

    /// Every destroyed resource, in order.
    pub fn destroyed(&self) -> Vec<Resource> {
        lock(&self.state).destroyed.clone()
    }

    /// Descriptions of resources that were released while an encode could still use them.
    pub fn violations(&self) -> Vec<String> {
        lock(&self.state).violations.clone()
    }

    pub fn encoder_params(&self) -> Option<EncoderParams> {
        lock(&self.state).encoder_params.clone()
    }

    /// The timeout of every wait so far, in order.
    pub fn wait_timeouts(&self) -> Vec<Duration> {
        lock(&self.state).wait_timeouts.clone()
    }

    pub fn last_wait_timeout(&self) -> Option<Duration> {
        lock(&self.state).wait_timeouts.last().copied()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }
}

impl EncodeApi for FakeApi {
    type Device = FakeDevice;
    type Session = FakeHandle;
    type Registered = FakeHandle;
    type Mapped = FakeHandle;
    type Bitstream = FakeHandle;
    type Event = FakeEvent;

    fn open_session(&self, _device: &FakeDevice) -> Result<FakeHandle, HardwareError> {
        let mut state = self.state();
        state.call(Operation::OpenSession)?;
        Ok(FakeHandle(state.create(Resource::Session)))
    }

    fn initialize_encoder(&self, _session: FakeHandle, params: &EncoderParams) -> Result<(), HardwareError> {
        let mut state = self.state();
        state.call(Operation::InitializeEncoder)?;
        state.encoder_params = Some(params.clone());
        Ok(())
    }

    fn destroy_encoder(&self, _session: FakeHandle) -> Result<(), HardwareError> {
        let mut state = self.state();
        let outstanding: usize = [
            Resource::Registered,
            Resource::Mapped,
            Resource::Bitstream,
            Resource::Event,
        ]
        .iter()
        .map(|resource| state.live.get(resource).copied().unwrap_or_default())
        .sum();
        if outstanding > 0 {
            state.violations.push(format!("session destroyed with {outstanding} resources alive"));
        }
        state.destroy(Resource::Session);
        Ok(())
    }

    fn register_resource(&self, _session: FakeHandle, texture: &FakeTexture, _desc: &TextureDesc) -> Result<FakeHandle, HardwareError> {
        let mut state = self.state();
        state.call(Operation::RegisterResource)?;
        let id = state.create(Resource::Registered);
        state.registrations.insert(id, texture.id);
        Ok(FakeHandle(id))
    }

    fn unregister_resource(&self, _session: FakeHandle, registered: FakeHandle) -> Result<(), HardwareError> {
        let mut state = self.state();
        let mappings = state
            .mappings
            .iter()
            .filter(|(_, r)| **r == registered.0)
            .map(|(m, _)| *m)
            .collect::<Vec<_>>();
        state.check_idle("registered resource", |encode| mappings.contains(&encode.mapped));
        if !mappings.is_empty() {
            state.violations.push("registered resource released while mapped".to_string());
        }
        state.registrations.remove(&registered.0);
        state.destroy(Resource::Registered);
        Ok(())
    }

    fn map_input(&self, _session: FakeHandle, registered: FakeHandle) -> Result<FakeHandle, HardwareError> {
        let mut state = self.state();
        state.call(Operation::MapInput)?;
        let id = state.create(Resource::Mapped);
        state.mappings.insert(id, registered.0);
        Ok(FakeHandle(id))
    }

    fn unmap_input(&self, _session: FakeHandle, mapped: FakeHandle) -> Result<(), HardwareError> {
        let mut state = self.state();
        state.check_idle("mapped input", |encode| encode.mapped == mapped.0);
        state.call(Operation::UnmapInput)?;
        state.mappings.remove(&mapped.0);
        state.destroy(Resource::Mapped);
        Ok(())
    }

    fn create_bitstream_buffer(&self, _session: FakeHandle) -> Result<FakeHandle, HardwareError> {
        let mut state = self.state();
        state.call(Operation::CreateBitstreamBuffer)?;
        Ok(FakeHandle(state.create(Resource::Bitstream)))
    }

    fn destroy_bitstream_buffer(&self, _session: FakeHandle, bitstream: FakeHandle) -> Result<(), HardwareError> {
        let mut state = self.state();
        state.check_idle("bitstream buffer", |encode| encode.bitstream == bitstream.0);
        state.bitstreams.remove(&bitstream.0);
        state.destroy(Resource::Bitstream);
        Ok(())
    }

    fn create_event(&self, _session: FakeHandle) -> Result<FakeEvent, HardwareError> {
        let mut state = self.state();
        state.call(Operation::CreateEvent)?;
        Ok(FakeEvent(state.create(Resource::Event)))
    }

    fn destroy_event(&self, _session: FakeHandle, event: FakeEvent) -> Result<(), HardwareError> {
        let mut state = self.state();
        state.check_idle("completion event", |encode| encode.event == event.0);
        if state.eos_event == Some(event.0) {
            state.violations.push("end of stream event released while pending".to_string());
        }
        state.signaled.remove(&event.0);
        state.destroy(Resource::Event);
        Ok(())
    }

    fn encode_picture(
        &self,
        _session: FakeHandle,
        mapped: FakeHandle,
        bitstream: FakeHandle,
        event: &FakeEvent,
        params: &PictureParams,
    ) -> Result<(), HardwareError> {
        let mut state = self.state();
        state.call(Operation::EncodePicture)?;
        let tag = state
            .mappings
            .get(&mapped.0)
            .and_then(|registered| state.registrations.get(registered))
            .and_then(|texture| state.contents.get(texture))
            .copied()
            .unwrap_or_default();
        state.pending.push_back(Encode {
            frame_index: params.frame_index,
            event: event.0,
            bitstream: bitstream.0,
            mapped: mapped.0,
            output: BitstreamData {
                data: FakeDevice::payload(tag, params.frame_index),
                is_keyframe: params.force_key_frame || params.frame_index == 0,
            },
        });
        if !state.manual_completion {
            let last = state.pending.len() - 1;
            state.complete(last);
            self.state.completed.notify_all();
        }
        Ok(())
    }

    fn end_of_stream(&self, _session: FakeHandle, event: &FakeEvent) -> Result<(), HardwareError> {
        let mut state = self.state();
        state.call(Operation::EndOfStream)?;
        if state.hang {
            state.eos_event = Some(event.0);
        } else {
            while state.complete(0) {}
            state.signaled.insert(event.0);
            self.state.completed.notify_all();
        }
        Ok(())
    }

    fn wait(&self, event: &FakeEvent, timeout: Duration) -> Result<bool, HardwareError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state();
        state.wait_timeouts.push(timeout);
        state.call(Operation::Wait)?;
        loop {
            // auto-reset, like a Win32 event
            if state.signaled.remove(&event.0) {
                return Ok(true);
            }
            state = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(false);
                    }
                    self.state.completed.wait_timeout(state, remaining).unwrap_or_else(PoisonError::into_inner).0
                }
                None => self.state.completed.wait(state).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    fn read_bitstream(&self, _session: FakeHandle, bitstream: FakeHandle) -> Result<BitstreamData, HardwareError> {
        let mut state = self.state();
        state.call(Operation::ReadBitstream)?;
        Ok(state.bitstreams.remove(&bitstream.0).unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::PixelFormat;

    #[test]
    fn test_fail_on() {
        let api = FakeApi::new();
        api.fail_on(Operation::CreateBitstreamBuffer, 1);
        let session = api.open_session(&api.device()).unwrap();
        assert!(api.create_bitstream_buffer(session).is_ok());
        assert_eq!(
            api.create_bitstream_buffer(session),
            Err(HardwareError { code: FAKE_ERROR_CODE })
        );
        assert!(api.create_bitstream_buffer(session).is_ok());
        assert_eq!(api.calls(Operation::CreateBitstreamBuffer), 3);
    }

    #[test]
    fn test_detects_release_while_pending() {
        let api = FakeApi::new();
        api.set_auto_complete(false);
        let device = api.device();
        let desc = TextureDesc {
            width: 4,
            height: 4,
            format: PixelFormat::Rgba8,
        };
        let session = api.open_session(&device).unwrap();
        let texture = device.create_texture(&desc).unwrap();
        let registered = api.register_resource(session, &texture, &desc).unwrap();
        let bitstream = api.create_bitstream_buffer(session).unwrap();
        let event = api.create_event(session).unwrap();
        let mapped = api.map_input(session, registered).unwrap();
        let params = PictureParams {
            frame_index: 0,
            width: 4,
            height: 4,
            force_key_frame: false,
        };
        api.encode_picture(session, mapped, bitstream, &event, &params).unwrap();
        assert_eq!(api.pending(), 1);

        api.destroy_bitstream_buffer(session, bitstream).unwrap();
        assert_eq!(api.violations().len(), 1);

        api.complete_next();
        assert!(api.wait(&event, Duration::ZERO).unwrap());
        assert!(!api.wait(&event, Duration::ZERO).unwrap());
    }

    #[test]
    fn test_wait_honors_timeout() {
        let api = FakeApi::new();
        let session = api.open_session(&api.device()).unwrap();
        let event = api.create_event(session).unwrap();

        let start = Instant::now();
        assert!(!api.wait(&event, Duration::from_millis(20)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(api.wait_timeouts(), vec![Duration::from_millis(20)]);
    }
}
