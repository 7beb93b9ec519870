//! A hardware video encoder built on NVENC that keeps a fixed ring of input textures and output
//! bitstreams in flight, so the caller can keep submitting frames while earlier ones are still
//! being encoded.
//!
//! [`RingEncoder`] is generic over [`EncodeApi`]. With the `driver` feature, `NvEncDriver`
//! implements it on top of the driver's function table. [`fake::FakeApi`] is an in-memory backend
//! for tests.

mod api;
pub use api::*;

mod config;
pub use config::NvencConfig;

mod device;
pub use device::*;

mod drain;
pub use drain::EncodedPayload;

#[cfg(feature = "driver")]
mod driver;
#[cfg(feature = "driver")]
pub use driver::{event, NvEncDevice, NvEncDriver};

mod error;
pub use error::*;

mod pipeline;
pub use pipeline::RingEncoder;

mod pool;
mod session;

mod video_encoder;
pub use video_encoder::*;

#[cfg(windows)]
mod d3d11;
#[cfg(windows)]
pub use d3d11::{D3D11Device, SharedHandle as D3D11SharedHandle};

#[cfg(any(test, feature = "fake"))]
pub mod fake;

#[cfg(test)]
mod capture;
