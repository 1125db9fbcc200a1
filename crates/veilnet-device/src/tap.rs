//! Kernel TAP interface driver.
//!
//! Opens a named layer-2 TUN/TAP device, configures address, netmask and
//! MTU, and brings it up. Reads and writes whole Ethernet frames; the
//! kernel preserves frame boundaries across `read` calls.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::info;

use crate::{DeviceError, FrameDevice, FrameSink, FrameSource};

/// TAP interface parameters
#[derive(Debug, Clone)]
pub struct TapConfig {
    /// Interface name (e.g. `veil0`)
    pub name: String,
    /// Device MTU in bytes
    pub mtu: u16,
    /// Interface IPv4 address
    pub ip_addr: Ipv4Addr,
    /// Interface netmask
    pub netmask: Ipv4Addr,
}

/// An open TAP device
pub struct TapDevice {
    mtu: u16,
    inner: tun::AsyncDevice,
}

impl TapDevice {
    /// Open and configure the TAP interface.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Config`] if the kernel rejects the interface
    /// (typically missing privileges or a name collision).
    pub fn open(config: &TapConfig) -> Result<Self, DeviceError> {
        let mut tun_config = tun::Configuration::default();
        tun_config
            .name(&config.name)
            .layer(tun::Layer::L2)
            .address(config.ip_addr)
            .netmask(config.netmask)
            .mtu(i32::from(config.mtu))
            .up();

        #[cfg(target_os = "linux")]
        tun_config.platform(|platform| {
            // Raw frames only; the 4-byte packet-information prefix would
            // corrupt the Ethernet header.
            platform.packet_information(false);
        });

        let inner = tun::create_as_async(&tun_config)
            .map_err(|e| DeviceError::Config(e.to_string()))?;

        info!(
            name = %config.name,
            mtu = config.mtu,
            addr = %config.ip_addr,
            "tap device up"
        );

        Ok(Self {
            mtu: config.mtu,
            inner,
        })
    }
}

impl FrameDevice for TapDevice {
    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        let mtu = self.mtu;
        let (read_half, write_half) = tokio::io::split(self.inner);

        (
            Box::new(TapSource {
                inner: read_half,
                buf: vec![0u8; usize::from(mtu) + 14],
            }),
            Box::new(TapSink { inner: write_half }),
        )
    }
}

struct TapSource {
    inner: ReadHalf<tun::AsyncDevice>,
    buf: Vec<u8>,
}

#[async_trait]
impl FrameSource for TapSource {
    async fn recv_frame(&mut self) -> Result<Vec<u8>, DeviceError> {
        let n = self.inner.read(&mut self.buf).await?;
        if n == 0 {
            return Err(DeviceError::Closed);
        }
        Ok(self.buf[..n].to_vec())
    }
}

struct TapSink {
    inner: WriteHalf<tun::AsyncDevice>,
}

#[async_trait]
impl FrameSink for TapSink {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), DeviceError> {
        self.inner.write_all(frame).await?;
        Ok(())
    }
}
