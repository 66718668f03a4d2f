//! Patches the NOR flash of Siemens PMB887x (SGOLD/SGOLD2) phones over the
//! "Chaos" service-mode serial loader: boots the loader, queries device
//! identity and flash geometry, then applies textual VKP patches by
//! performing read-modify-write cycles on whole erase blocks.

pub mod blockmap;
pub mod bootstrap;
pub mod bytestream;
pub mod chaos;
pub mod device;
pub mod error;
pub mod fullflash;
pub mod patch_engine;
pub mod remote;
pub mod vkp;

pub use blockmap::BlockMap;
pub use chaos::{ChaosProtocol, PhoneInfo};
pub use device::FlashDevice;
pub use error::{Error, Result};
pub use patch_engine::{PatchEngine, PatchOptions};
pub use vkp::Chunk;
