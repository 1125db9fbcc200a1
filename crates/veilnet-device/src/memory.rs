//! In-memory loopback device for tests.
//!
//! `MemoryDevice::pair` returns two cross-connected devices: every frame
//! written to one is readable from the other, with frame boundaries
//! preserved. Used by the integration tests in place of a kernel TAP
//! interface.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{DeviceError, FrameDevice, FrameSink, FrameSource};

/// One side of an in-memory device pair
pub struct MemoryDevice {
    mtu: u16,
    rx: mpsc::Receiver<Vec<u8>>,
    tx: mpsc::Sender<Vec<u8>>,
}

impl MemoryDevice {
    /// Create a cross-connected pair with the given MTU.
    #[must_use]
    pub fn pair(mtu: u16) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(256);
        let (b_tx, a_rx) = mpsc::channel(256);

        (
            Self {
                mtu,
                rx: a_rx,
                tx: a_tx,
            },
            Self {
                mtu,
                rx: b_rx,
                tx: b_tx,
            },
        )
    }
}

impl FrameDevice for MemoryDevice {
    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        (
            Box::new(MemorySource { rx: self.rx }),
            Box::new(MemorySink { tx: self.tx }),
        )
    }
}

struct MemorySource {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv_frame(&mut self) -> Result<Vec<u8>, DeviceError> {
        self.rx.recv().await.ok_or(DeviceError::Closed)
    }
}

struct MemorySink {
    tx: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), DeviceError> {
        self.tx
            .send(frame.to_vec())
            .await
            .map_err(|_| DeviceError::Closed)
    }
}
