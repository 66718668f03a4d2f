//! Composes [`BlockMap`], parsed [`Chunk`]s and a [`FlashDevice`] into the
//! read-modify-write cycle that applies (or reverts) a patch.
//!
//! Grounded on `cmd/chaosloader/apply_patch.go::DoApplyPatch`: populate a
//! block cache by reading every distinct block touched by any chunk, verify
//! and mutate the cache in memory, then flush every cached block back in
//! one `Write` per block.

use std::collections::HashMap;

use log::{info, warn};

use crate::blockmap::BlockMap;
use crate::device::FlashDevice;
use crate::error::{Error, Result};
use crate::vkp::Chunk;

const READ_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct PatchOptions {
    pub revert: bool,
    pub dry_run: bool,
    pub force: bool,
}

pub struct PatchEngine<'a, D: FlashDevice> {
    device: &'a mut D,
    options: PatchOptions,
}

impl<'a, D: FlashDevice> PatchEngine<'a, D> {
    pub fn new(device: &'a mut D, options: PatchOptions) -> Self {
        PatchEngine { device, options }
    }

    /// Applies (or, with `options.revert`, reverts) `chunks` against the
    /// device, returning the `BlockMap` used so callers can log geometry.
    pub async fn apply(&mut self, chunks: &[Chunk]) -> Result<BlockMap> {
        let info = self.device.read_info().await?;
        let block_map = info.block_map;

        let mut cache = self.populate_cache(chunks, &block_map).await?;
        self.verify_and_mutate(chunks, &block_map, &mut cache)?;

        if self.options.dry_run {
            info!("dry run: not flushing {} block(s)", cache.len());
            return Ok(block_map);
        }

        self.flush(&cache).await?;
        Ok(block_map)
    }

    async fn populate_cache(
        &mut self,
        chunks: &[Chunk],
        block_map: &BlockMap,
    ) -> Result<HashMap<u64, Vec<u8>>> {
        let mut cache: HashMap<u64, Vec<u8>> = HashMap::new();

        for chunk in chunks {
            let mut addr = chunk.base_addr;
            while addr < chunk.end_addr() {
                let (block_base, block_size) = block_map.params_for_addr(addr)?;
                if !cache.contains_key(&block_base) {
                    info!("reading block @ 0x{block_base:X} size 0x{block_size:X}");
                    let data = self.read_block_with_retries(block_base, block_size).await?;
                    cache.insert(block_base, data);
                }
                addr = block_base + block_size;
            }
        }
        Ok(cache)
    }

    async fn read_block_with_retries(&mut self, block_base: u64, block_size: u64) -> Result<Vec<u8>> {
        let mut last_err = None;
        for attempt in 0..READ_RETRIES {
            match self.device.read_flash(block_base as u32, block_size as u32).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    warn!("read of block 0x{block_base:X} failed (attempt {attempt}): {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(Error::ReadFailed(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    fn verify_and_mutate(
        &self,
        chunks: &[Chunk],
        block_map: &BlockMap,
        cache: &mut HashMap<u64, Vec<u8>>,
    ) -> Result<()> {
        for chunk in chunks {
            let mut addr = chunk.base_addr;
            while addr < chunk.end_addr() {
                let (block_base, _) = block_map.params_for_addr(addr)?;
                let off = (addr - block_base) as usize;
                let data_off = (addr - chunk.base_addr) as usize;

                let (want_old, new_byte) = if self.options.revert {
                    (chunk.new_data[data_off], chunk.old_data[data_off])
                } else {
                    (chunk.old_data[data_off], chunk.new_data[data_off])
                };

                let block = cache.get_mut(&block_base).ok_or_else(|| {
                    Error::ProtocolError(format!(
                        "block 0x{block_base:X} was not cached before verification"
                    ))
                })?;
                let got_old = block[off];
                if got_old != want_old {
                    if self.options.force {
                        warn!(
                            "pre-image mismatch at 0x{:X}: expected 0x{:02X}, found 0x{:02X} (forcing)",
                            addr, want_old, got_old
                        );
                    } else {
                        return Err(Error::PreImageMismatch {
                            addr,
                            expected: want_old,
                            actual: got_old,
                        });
                    }
                }
                block[off] = new_byte;
                addr += 1;
            }
        }
        Ok(())
    }

    async fn flush(&mut self, cache: &HashMap<u64, Vec<u8>>) -> Result<()> {
        for (&block_base, data) in cache {
            info!("writing block @ 0x{block_base:X} len 0x{:X}", data.len());
            self.device
                .write_flash(block_base as u32, data)
                .await
                .map_err(|e| Error::WriteFailed(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fullflash::FullflashBackend;
    use std::io::Write as _;

    async fn backend_filled(len: usize, fill: u8) -> (FullflashBackend, tempfile::TempPath) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![fill; len]).unwrap();
        tmp.flush().unwrap();
        let path = tmp.into_temp_path();
        let backend = FullflashBackend::open(path.to_str().unwrap()).await.unwrap();
        (backend, path)
    }

    #[tokio::test]
    async fn apply_then_revert_round_trips() {
        let (mut backend, _path) = backend_filled(0x20000, 0xFF).await;
        let chunks = crate::vkp::parse("#pragma enable old_equal_ff\nA0000000: 4142\n").unwrap();

        let mut engine = PatchEngine::new(&mut backend, PatchOptions::default());
        engine.apply(&chunks).await.unwrap();

        let data = backend.read_flash(0xA0000000, 4).await.unwrap();
        assert_eq!(&data, &[0x41, 0x42, 0xFF, 0xFF]);

        let mut engine = PatchEngine::new(
            &mut backend,
            PatchOptions {
                revert: true,
                ..Default::default()
            },
        );
        engine.apply(&chunks).await.unwrap();
        let data = backend.read_flash(0xA0000000, 4).await.unwrap();
        assert_eq!(&data, &[0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[tokio::test]
    async fn dry_run_does_not_write() {
        let (mut backend, _path) = backend_filled(0x20000, 0xFF).await;
        let chunks = crate::vkp::parse("#pragma enable old_equal_ff\nA0000000: 4142\n").unwrap();

        let mut engine = PatchEngine::new(
            &mut backend,
            PatchOptions {
                dry_run: true,
                ..Default::default()
            },
        );
        engine.apply(&chunks).await.unwrap();

        let data = backend.read_flash(0xA0000000, 4).await.unwrap();
        assert_eq!(&data, &[0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[tokio::test]
    async fn pre_image_mismatch_without_force_fails() {
        let (mut backend, _path) = backend_filled(0x20000, 0x00).await;
        let chunks = crate::vkp::parse("#pragma enable old_equal_ff\nA0000000: 4142\n").unwrap();

        let mut engine = PatchEngine::new(&mut backend, PatchOptions::default());
        let err = engine.apply(&chunks).await.unwrap_err();
        assert!(matches!(err, Error::PreImageMismatch { .. }));
    }

    #[tokio::test]
    async fn pre_image_mismatch_with_force_proceeds() {
        let (mut backend, _path) = backend_filled(0x20000, 0x00).await;
        let chunks = crate::vkp::parse("#pragma enable old_equal_ff\nA0000000: 4142\n").unwrap();

        let mut engine = PatchEngine::new(
            &mut backend,
            PatchOptions {
                force: true,
                ..Default::default()
            },
        );
        engine.apply(&chunks).await.unwrap();
        let data = backend.read_flash(0xA0000000, 4).await.unwrap();
        assert_eq!(&data, &[0x41, 0x42, 0x00, 0x00]);
    }
}
