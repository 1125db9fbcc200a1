//! # VEILNET Device
//!
//! The virtual L2 device layer. The core consumes exactly three operations
//! from a device: read an Ethernet frame, write an Ethernet frame, and
//! report the configured MTU. [`FrameDevice`] captures that contract;
//! [`TapDevice`] implements it over a kernel TAP interface, and
//! [`MemoryDevice`] provides a loopback pair for tests.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod memory;
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub mod tap;

pub use error::DeviceError;
pub use memory::MemoryDevice;
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub use tap::{TapConfig, TapDevice};

use async_trait::async_trait;

/// Minimum Ethernet frame the pipeline will carry (the 14-byte header)
pub const MIN_FRAME_SIZE: usize = 14;

/// Reads Ethernet frames from a virtual device, one frame per call
#[async_trait]
pub trait FrameSource: Send {
    /// Read the next frame. Returns at least 14 bytes.
    async fn recv_frame(&mut self) -> Result<Vec<u8>, DeviceError>;
}

/// Writes Ethernet frames to a virtual device
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame.
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), DeviceError>;
}

/// An owned virtual Ethernet device.
///
/// Ownership is exclusive to the endpoint process for the device's
/// lifetime; `split` hands the two directions to independent tasks.
pub trait FrameDevice: Send {
    /// The device MTU (payload bytes, excluding the Ethernet header)
    fn mtu(&self) -> u16;

    /// Split into independently owned read and write halves
    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>);
}
