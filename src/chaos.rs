//! Post-boot Chaos command protocol: ping, info, read, write, set-speed.
//!
//! Wire encoding is big-endian for fixed command headers; the info reply
//! and the loader frame length prefix (in [`crate::bootstrap`]) are
//! little-endian. Bit-exact against the reference implementation's
//! `pkg/pmb887x/chaosloader.go` and the 128-byte info packets captured in
//! its test fixtures.

use std::time::Duration;

use deku::prelude::*;
use log::{debug, info, warn};

use crate::blockmap::BlockMap;
use crate::bytestream::{read_exact, ByteStream};
use crate::device::FlashDevice;
use crate::error::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_FLASH_REGIONS: usize = 6;

/// One `(blocksNumMinus1, blockSizeDiv256)` entry in the info reply's
/// region table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct RegionEntry {
    blocks_num_minus1: u16,
    block_size_div256: u16,
}

/// Raw 128-byte wire layout of the `Info` reply.
///
/// Byte 0x57 (87) carries the active region count; this diverges from a
/// widely circulated "byte 0x4E" description of the format, which does not
/// hold up against either sample in the reference test fixtures (both have
/// zero at 0x4E). The value at 0x57 matches the reference `EL71` (1 region)
/// and `C81` (4 region) samples exactly, so that is what this crate reads.
#[derive(Debug, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct ChaosInfoWire {
    model_name: [u8; 16],
    manufacturer: [u8; 16],
    imei: [u8; 16],
    _unique_id: [u8; 16],
    #[deku(pad_bytes_after = "19")]
    flash_base_addr: u32,
    flash_regions_num: u8,
    regions: [RegionEntry; MAX_FLASH_REGIONS],
    _trailer: [u8; 16],
}

/// Device identity and flash geometry, parsed from a 128-byte `Info` reply.
#[derive(Debug, Clone)]
pub struct PhoneInfo {
    pub model_name: String,
    pub manufacturer: String,
    pub imei: String,
    pub flash_base_addr: u32,
    pub block_map: BlockMap,
}

fn trim_nul(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

impl PhoneInfo {
    fn parse(raw: &[u8; 128]) -> Result<Self> {
        let (_, wire) = ChaosInfoWire::from_bytes((raw.as_slice(), 0))
            .map_err(|e| Error::ProtocolError(format!("malformed info reply: {e}")))?;

        if wire.flash_regions_num as usize > MAX_FLASH_REGIONS {
            return Err(Error::UnsupportedFlash(wire.flash_regions_num as usize));
        }

        let mut block_map = BlockMap::new(wire.flash_base_addr as u64);
        for region in wire.regions.iter().take(wire.flash_regions_num as usize) {
            let block_size = region.block_size_div256 as u64 * 256;
            let block_count = region.blocks_num_minus1 as u64 + 1;
            block_map.add_region(block_size, block_count);
        }

        Ok(PhoneInfo {
            model_name: trim_nul(&wire.model_name),
            manufacturer: trim_nul(&wire.manufacturer),
            imei: trim_nul(&wire.imei),
            flash_base_addr: wire.flash_base_addr,
            block_map,
        })
    }
}

/// The command/response protocol, talking over any [`ByteStream`].
pub struct ChaosProtocol<S: ByteStream> {
    stream: S,
    timeout: Duration,
    block_map: Option<BlockMap>,
}

impl<S: ByteStream> ChaosProtocol<S> {
    /// Consumes the loader-ready byte (`0xA5`) and performs the mandatory
    /// warm-up ping, per §4.5.
    pub async fn activate(mut stream: S) -> Result<Self> {
        let mut ready = [0u8; 1];
        read_exact(&mut stream, &mut ready, DEFAULT_TIMEOUT).await?;
        if ready[0] != 0xA5 {
            return Err(Error::ProtocolError(format!(
                "unexpected loader-ready byte 0x{:02X}",
                ready[0]
            )));
        }

        let mut chaos = ChaosProtocol {
            stream,
            timeout: DEFAULT_TIMEOUT,
            block_map: None,
        };
        if !chaos.ping().await? {
            return Err(Error::ProtocolError(
                "loader did not reply to the warm-up ping".to_string(),
            ));
        }
        Ok(chaos)
    }

    async fn read_timeout(&mut self, buf: &mut [u8]) -> Result<()> {
        read_exact(&mut self.stream, buf, self.timeout).await
    }

    /// Returns the device's flash geometry, querying it with `Info` the
    /// first time it's needed and caching it afterward.
    async fn ensure_block_map(&mut self) -> Result<&BlockMap> {
        if self.block_map.is_none() {
            let info = self.read_info_uncached().await?;
            self.block_map = Some(info.block_map);
        }
        Ok(self.block_map.as_ref().expect("just populated"))
    }

    async fn read_info_uncached(&mut self) -> Result<PhoneInfo> {
        info!("requesting chaos info");
        self.stream.write_all(b"I").await?;
        let mut raw = [0u8; 128];
        self.read_timeout(&mut raw).await?;
        PhoneInfo::parse(&raw)
    }
}

impl<S: ByteStream> FlashDevice for ChaosProtocol<S> {
    async fn ping(&mut self) -> Result<bool> {
        self.stream.write_all(b"A").await?;
        let mut reply = [0u8; 1];
        self.read_timeout(&mut reply).await?;
        Ok(reply[0] == b'R')
    }

    async fn read_info(&mut self) -> Result<PhoneInfo> {
        let info = self.read_info_uncached().await?;
        self.block_map = Some(info.block_map.clone());
        Ok(info)
    }

    async fn read_flash(&mut self, addr: u32, size: u32) -> Result<Vec<u8>> {
        let mut request = Vec::with_capacity(9);
        request.push(b'R');
        request.extend_from_slice(&addr.to_be_bytes());
        request.extend_from_slice(&size.to_be_bytes());
        self.stream.write_all(&request).await?;

        let mut reply = vec![0u8; size as usize + 4];
        self.read_timeout(&mut reply).await?;

        let (data, trailer) = reply.split_at(size as usize);
        if trailer[0] != b'O' || trailer[1] != b'K' {
            return Err(Error::ProtocolError(format!(
                "expected 'OK' trailer after read, got {:02X} {:02X}",
                trailer[0], trailer[1]
            )));
        }
        let checksum = trailer[2];
        let computed = data.iter().fold(0u8, |acc, &b| acc ^ b);
        if checksum != computed {
            return Err(Error::ChecksumMismatch {
                expected: checksum,
                actual: computed,
            });
        }
        Ok(data.to_vec())
    }

    async fn write_flash(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let block_map = self.ensure_block_map().await?;
        if !block_map.is_aligned_block(addr as u64, data.len() as u64) {
            return Err(Error::Misalignment {
                addr: addr as u64,
                end: addr as u64 + data.len() as u64,
            });
        }

        let mut request = Vec::with_capacity(9 + data.len() + 1);
        request.push(b'F');
        request.extend_from_slice(&addr.to_be_bytes());
        request.extend_from_slice(&(data.len() as u32).to_be_bytes());
        request.extend_from_slice(data);
        let checksum = data.iter().fold(0u8, |acc, &b| acc ^ b);
        request.push(checksum);
        self.stream.write_all(&request).await?;

        for expected in [[0x01u8, 0x01], [0x02, 0x02], [0x03, 0x03]] {
            let mut ack = [0u8; 2];
            self.read_timeout(&mut ack).await?;
            if ack != expected {
                return Err(Error::ProtocolError(format!(
                    "expected staged ack {expected:02X?}, got {ack:02X?}"
                )));
            }
        }

        let mut status = [0u8; 4];
        self.read_timeout(&mut status).await?;
        debug!("write status bytes: {status:02X?}");

        if !self.ping().await? {
            return Err(Error::ProtocolError(
                "loader did not respond to post-write ping".to_string(),
            ));
        }
        Ok(())
    }

    async fn set_speed(&mut self, rate: u32) -> Result<()> {
        let code = crate::bytestream::baud_code(rate).ok_or(Error::UnsupportedSpeed(rate))?;
        self.stream.write_all(&[b'H', code]).await?;
        let mut ack = [0u8; 1];
        self.read_timeout(&mut ack).await?;
        if ack[0] != 0x68 {
            return Err(Error::ProtocolError(format!(
                "unexpected SetSpeed ack 0x{:02X}",
                ack[0]
            )));
        }
        self.stream.set_baud(rate).await?;

        let mut confirm = [0u8; 1];
        self.read_timeout(&mut confirm).await?;
        if confirm[0] != b'A' && confirm[0] != 0x48 {
            warn!("unexpected post-speed-change confirmation byte 0x{:02X}", confirm[0]);
            return Err(Error::ProtocolError(format!(
                "unexpected post-speed-change confirmation 0x{:02X}",
                confirm[0]
            )));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stream.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn el71_info_bytes() -> [u8; 128] {
        let hex = "454C37310000000000000000000000005349454D454E53000000000000000000\
585858585858585858585858585858008F77473E07433B6A6AA7A8BC4217BD5A000000A0A975DC16\
000300000000000020001988010A0201FF000004FFFFFFFFFFFFFFFFFFFFFFFF0000000000000000\
00000000000000000000000000000000000000";
        let bytes = hex::decode(hex).unwrap();
        bytes.try_into().unwrap()
    }

    fn c81_info_bytes() -> [u8; 128] {
        let hex = "433831000000000000000000000000005349454D454E53000000000000000000585858585858\
58585858585858585800664C544260E5CC2931FBF4799D65BE27000000A003C25490000300000000\
000089000D8802060004FE0000020300800003008000FE0000025052493133A60000000000000000\
00000000000000000000";
        let bytes = hex::decode(hex.replace('\n', "")).unwrap();
        bytes.try_into().unwrap()
    }

    #[test]
    fn parses_el71_single_region() {
        let info = PhoneInfo::parse(&el71_info_bytes()).unwrap();
        assert_eq!(info.model_name, "EL71");
        assert_eq!(info.manufacturer, "SIEMENS");
        assert_eq!(info.flash_base_addr, 0xA0000000);
        assert_eq!(info.block_map.regions().len(), 1);
        assert_eq!(info.block_map.total_size(), 64 * 1024 * 1024);
    }

    #[test]
    fn parses_c81_four_regions() {
        let info = PhoneInfo::parse(&c81_info_bytes()).unwrap();
        assert_eq!(info.model_name, "C81");
        assert_eq!(info.block_map.regions().len(), 4);
        assert_eq!(info.block_map.total_size(), 64 * 1024 * 1024);
    }
}
