//! Alternate `FlashDevice` backed by a local file: a byte-for-byte flash
//! dump used for dry runs and offline testing, in place of a real device.
//!
//! Grounded on `pkg/device/fullflash.go` and `fullflash_loader.go`: flash
//! addresses are translated to file offsets by subtracting the synthesized
//! BlockMap's base address (`0xA0000000`), and `ReadInfo` derives a
//! single-region BlockMap from `file_len / 0x20000`.

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::blockmap::BlockMap;
use crate::chaos::PhoneInfo;
use crate::device::FlashDevice;
use crate::error::{Error, Result};

const SYNTHETIC_BASE_ADDR: u64 = 0xA0000000;
const SYNTHETIC_BLOCK_SIZE: u64 = 0x20000;

pub struct FullflashBackend {
    file: File,
    file_len: u64,
}

impl FullflashBackend {
    pub async fn open(path: &str) -> Result<Self> {
        let file = File::options().read(true).write(true).open(path).await?;
        let file_len = file.metadata().await?.len();
        Ok(FullflashBackend { file, file_len })
    }

    fn check_bounds(&self, offset: u64, len: u64) -> Result<()> {
        if offset + len > self.file_len {
            return Err(Error::OutOfRange {
                addr: SYNTHETIC_BASE_ADDR + offset,
                base: SYNTHETIC_BASE_ADDR,
                end: SYNTHETIC_BASE_ADDR + self.file_len,
            });
        }
        Ok(())
    }
}

impl FlashDevice for FullflashBackend {
    async fn ping(&mut self) -> Result<bool> {
        Ok(true)
    }

    async fn read_info(&mut self) -> Result<PhoneInfo> {
        let mut block_map = BlockMap::new(SYNTHETIC_BASE_ADDR);
        let block_count = self.file_len / SYNTHETIC_BLOCK_SIZE;
        block_map.add_region(SYNTHETIC_BLOCK_SIZE, block_count);

        Ok(PhoneInfo {
            model_name: "Fullflash dump".to_string(),
            manufacturer: "siemens-mobile-hacks Org".to_string(),
            imei: "xxxxxxxxxxxxxxx".to_string(),
            flash_base_addr: SYNTHETIC_BASE_ADDR as u32,
            block_map,
        })
    }

    async fn read_flash(&mut self, addr: u32, size: u32) -> Result<Vec<u8>> {
        let offset = addr as u64 - SYNTHETIC_BASE_ADDR;
        self.check_bounds(offset, size as u64)?;
        self.file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; size as usize];
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn write_flash(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let offset = addr as u64 - SYNTHETIC_BASE_ADDR;
        self.check_bounds(offset, data.len() as u64)?;
        self.file.seek(std::io::SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    async fn backend_with(len: usize, fill: u8) -> (FullflashBackend, tempfile::TempPath) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![fill; len]).unwrap();
        tmp.flush().unwrap();
        let path = tmp.into_temp_path();
        let backend = FullflashBackend::open(path.to_str().unwrap()).await.unwrap();
        (backend, path)
    }

    #[tokio::test]
    async fn read_info_derives_single_region_blockmap() {
        let (mut backend, _path) = backend_with(64 * 1024 * 1024, 0xFF).await;
        let info = backend.read_info().await.unwrap();
        assert_eq!(info.block_map.regions().len(), 1);
        assert_eq!(info.block_map.total_size(), 64 * 1024 * 1024);
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (mut backend, _path) = backend_with(0x20000, 0xFF).await;
        backend
            .write_flash(0xA0000000, &[0x41, 0x42])
            .await
            .unwrap();
        let data = backend.read_flash(0xA0000000, 4).await.unwrap();
        assert_eq!(data, vec![0x41, 0x42, 0xFF, 0xFF]);
    }

    #[tokio::test]
    async fn out_of_bounds_read_fails() {
        let (mut backend, _path) = backend_with(0x1000, 0xFF).await;
        assert!(backend.read_flash(0xA0000000, 0x2000).await.is_err());
    }
}
