use crate::{
    api::{BitstreamData, EncodeApi, PictureParams, SharedHandle, Texture},
    device::{GraphicsDevice, TextureDesc},
    session::Session,
    CompletionFailedSnafu, EncodeSubmitFailedSnafu, HardwareError, NvencError, ResourceAllocationFailedSnafu, Result,
};
use log::{debug, error, trace, warn};
use scopeguard::{guard, ScopeGuard};
use snafu::ResultExt;
use std::{mem, mem::ManuallyDrop, sync::Arc, time::Duration};

/// One reusable set of encode resources.
///
/// A slot is in flight exactly when `mapped` is set: from a successful encode submission until its
/// output has been drained.
pub(crate) struct Slot<A: EncodeApi> {
    index: usize,
    mapped: Option<A::Mapped>,
    // an input whose unmap failed, retried before the slot is reused or destroyed
    unreleased: Option<A::Mapped>,
    registered: A::Registered,
    bitstream: A::Bitstream,
    completion: ManuallyDrop<A::Event>,
    shared: ManuallyDrop<SharedHandle<A>>,
    texture: ManuallyDrop<Texture<A>>,
    flush_timeout: Duration,
    session: Arc<Session<A>>,
}

impl<A: EncodeApi> Slot<A> {
    fn new(session: &Arc<Session<A>>, device: &A::Device, desc: &TextureDesc, index: usize, flush_timeout: Duration) -> Result<Self> {
        let api = session.api();
        let handle = session.handle();

        let texture = device
            .create_texture(desc)
            .context(ResourceAllocationFailedSnafu { slot: index, operation: "creating texture" })?;
        let shared = device.share_texture(&texture).context(ResourceAllocationFailedSnafu {
            slot: index,
            operation: "sharing texture",
        })?;

        let registered = api.register_resource(handle, &texture, desc).context(ResourceAllocationFailedSnafu {
            slot: index,
            operation: "registering resource",
        })?;
        let registered = guard(registered, |registered| {
            if let Err(e) = api.unregister_resource(handle, registered) {
                warn!("unable to unregister resource for slot {index}: {e}");
            }
        });

        let bitstream = api.create_bitstream_buffer(handle).context(ResourceAllocationFailedSnafu {
            slot: index,
            operation: "creating bitstream buffer",
        })?;
        let bitstream = guard(bitstream, |bitstream| {
            if let Err(e) = api.destroy_bitstream_buffer(handle, bitstream) {
                warn!("unable to destroy bitstream buffer for slot {index}: {e}");
            }
        });

        let completion = api.create_event(handle).context(ResourceAllocationFailedSnafu {
            slot: index,
            operation: "creating completion event",
        })?;

        Ok(Self {
            index,
            mapped: None,
            unreleased: None,
            bitstream: ScopeGuard::into_inner(bitstream),
            registered: ScopeGuard::into_inner(registered),
            completion: ManuallyDrop::new(completion),
            shared: ManuallyDrop::new(shared),
            texture: ManuallyDrop::new(texture),
            flush_timeout,
            session: session.clone(),
        })
    }

    pub fn is_in_flight(&self) -> bool {
        self.mapped.is_some()
    }

    /// Copies `source` into the slot's texture and submits it. The slot is left untouched if this
    /// fails.
    pub fn submit(&mut self, device: &A::Device, source: &Texture<A>, params: &PictureParams) -> Result<()> {
        let api = self.session.api();
        let handle = self.session.handle();

        if let Some(mapped) = self.unreleased {
            api.unmap_input(handle, mapped).context(EncodeSubmitFailedSnafu {
                operation: "unmapping previous input",
            })?;
            self.unreleased = None;
        }
        device
            .copy_texture(source, &self.texture)
            .context(EncodeSubmitFailedSnafu { operation: "copying frame" })?;
        let mapped = api
            .map_input(handle, self.registered)
            .context(EncodeSubmitFailedSnafu { operation: "mapping input" })?;
        if let Err(source) = api.encode_picture(handle, mapped, self.bitstream, &self.completion, params) {
            if let Err(e) = api.unmap_input(handle, mapped) {
                warn!("unable to unmap input for slot {} after failed submission: {e}", self.index);
            }
            return Err(NvencError::EncodeSubmitFailed {
                operation: "encoding picture",
                source,
            });
        }
        self.mapped = Some(mapped);
        Ok(())
    }

    pub fn wait(&self, timeout: Duration) -> Result<bool, HardwareError> {
        self.session.api().wait(&self.completion, timeout)
    }

    /// Releases a slot whose completion has fired and reads its output. The slot is no longer in
    /// flight afterwards, even if this fails.
    pub fn finish(&mut self, index: u64) -> Result<BitstreamData> {
        let api = self.session.api();
        let handle = self.session.handle();
        if let Some(mapped) = self.mapped.take() {
            if let Err(source) = api.unmap_input(handle, mapped) {
                self.unreleased = Some(mapped);
                return Err(NvencError::CompletionFailed {
                    index,
                    operation: "unmapping input",
                    source,
                });
            }
        }
        api.read_bitstream(handle, self.bitstream).context(CompletionFailedSnafu {
            index,
            operation: "reading bitstream",
        })
    }
}

impl<A: EncodeApi> Drop for Slot<A> {
    fn drop(&mut self) {
        let api = self.session.api();
        let handle = self.session.handle();

        if let Some(mapped) = self.mapped.take() {
            match api.wait(&self.completion, self.flush_timeout) {
                Ok(true) => {
                    if let Err(e) = api.unmap_input(handle, mapped) {
                        warn!("unable to unmap input for slot {}: {e}", self.index);
                    }
                }
                result => {
                    if let Err(e) = result {
                        warn!("unable to wait for slot {}: {e}", self.index);
                    }
                    // The hardware may still write to these, so they're never released. Neither is
                    // the session they belong to.
                    error!("slot {} is still in flight, leaking its resources", self.index);
                    mem::forget(self.session.clone());
                    return;
                }
            }
        }
        if let Some(mapped) = self.unreleased.take() {
            if let Err(e) = api.unmap_input(handle, mapped) {
                warn!("unable to unmap input for slot {}: {e}", self.index);
            }
        }

        if let Err(e) = api.unregister_resource(handle, self.registered) {
            warn!("unable to unregister resource for slot {}: {e}", self.index);
        }
        if let Err(e) = api.destroy_bitstream_buffer(handle, self.bitstream) {
            warn!("unable to destroy bitstream buffer for slot {}: {e}", self.index);
        }
        // SAFETY: each of these is taken exactly once, here.
        let (completion, shared, texture) = unsafe {
            (
                ManuallyDrop::take(&mut self.completion),
                ManuallyDrop::take(&mut self.shared),
                ManuallyDrop::take(&mut self.texture),
            )
        };
        if let Err(e) = api.destroy_event(handle, completion) {
            warn!("unable to destroy completion event for slot {}: {e}", self.index);
        }
        drop(shared);
        drop(texture);
        trace!("released slot {}", self.index);
    }
}

/// The fixed set of slots for a session, plus the signal used by the end-of-stream sentinel.
pub(crate) struct Pool<A: EncodeApi> {
    slots: Vec<Slot<A>>,
    eos: ManuallyDrop<A::Event>,
    eos_pending: bool,
    session: Arc<Session<A>>,
}

impl<A: EncodeApi> Pool<A> {
    pub fn new(session: Arc<Session<A>>, device: &A::Device, desc: &TextureDesc, size: usize, flush_timeout: Duration) -> Result<Self> {
        let slots = (0..size)
            .map(|index| Slot::new(&session, device, desc, index, flush_timeout))
            .collect::<Result<Vec<_>>>()?;
        let eos = session.api().create_event(session.handle()).context(ResourceAllocationFailedSnafu {
            slot: size,
            operation: "creating end of stream event",
        })?;
        debug!("created pool of {size} slots");
        Ok(Self {
            slots,
            eos: ManuallyDrop::new(eos),
            eos_pending: false,
            session,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns the slot that the given cursor value maps to.
    pub fn slot(&self, cursor: u64) -> &Slot<A> {
        &self.slots[(cursor % self.slots.len() as u64) as usize]
    }

    pub fn slot_mut(&mut self, cursor: u64) -> &mut Slot<A> {
        let len = self.slots.len() as u64;
        &mut self.slots[(cursor % len) as usize]
    }

    pub fn end_of_stream(&mut self) -> Result<(), HardwareError> {
        self.session.api().end_of_stream(self.session.handle(), &self.eos)?;
        self.eos_pending = true;
        Ok(())
    }

    /// Returns `Ok(true)` once the end-of-stream sentinel has been processed.
    pub fn wait_end_of_stream(&mut self, timeout: Duration) -> Result<bool, HardwareError> {
        if !self.eos_pending {
            return Ok(true);
        }
        let done = self.session.api().wait(&self.eos, timeout)?;
        if done {
            self.eos_pending = false;
        }
        Ok(done)
    }
}

impl<A: EncodeApi> Drop for Pool<A> {
    fn drop(&mut self) {
        // in reverse order of creation
        while let Some(slot) = self.slots.pop() {
            drop(slot);
        }
        if self.eos_pending {
            error!("end of stream was never acknowledged, leaking its event");
            mem::forget(self.session.clone());
        } else {
            // SAFETY: taken exactly once, here.
            let eos = unsafe { ManuallyDrop::take(&mut self.eos) };
            if let Err(e) = self.session.api().destroy_event(self.session.handle(), eos) {
                warn!("unable to destroy end of stream event: {e}");
            }
        }
        debug!("destroyed pool");
    }
}
