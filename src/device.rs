//! The capability abstraction [`PatchEngine`](crate::patch_engine::PatchEngine)
//! is polymorphic over: ping, read info, read flash, write flash, change
//! speed. [`crate::chaos::ChaosProtocol`] (a real or emulated device over a
//! [`crate::bytestream::ByteStream`]) and [`crate::fullflash::FullflashBackend`]
//! (a local file) both implement it.
//!
//! Modeled on `installer::connection::DeviceConnection`, which plays the
//! same role between the installer's device-control code and its telnet/ADB
//! backends.

use std::future::Future;

use crate::chaos::PhoneInfo;
use crate::error::Result;

pub trait FlashDevice: Send {
    /// Verifies the loader is alive and responsive.
    fn ping(&mut self) -> impl Future<Output = Result<bool>> + Send;

    /// Reads the device identity and flash geometry.
    fn read_info(&mut self) -> impl Future<Output = Result<PhoneInfo>> + Send;

    /// Reads `size` bytes starting at `addr`.
    fn read_flash(&mut self, addr: u32, size: u32) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Writes `data` at `addr`. The caller (normally
    /// [`crate::patch_engine::PatchEngine`]) is responsible for ensuring the
    /// write is a single, block-aligned erase block.
    fn write_flash(&mut self, addr: u32, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Renegotiates the link's baud rate, where applicable.
    fn set_speed(&mut self, _rate: u32) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Releases the underlying transport. Must run on all exit paths.
    fn disconnect(&mut self) -> impl Future<Output = Result<()>> + Send;
}
