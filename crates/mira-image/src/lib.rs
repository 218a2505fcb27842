//! The MIRA `Image` data object.
//!
//! An [`Image`] owns pixel data that may be resident in several places at
//! once: a host array, and per-accelerator image and buffer allocations.
//! The residency tracker records which copies are up to date; access goes
//! through scoped guards that enforce single-writer/many-reader discipline
//! and trigger lazy allocation and transfer on demand.
//!
//! ```no_run
//! use mira_core::{AcceleratorDevice, DataType};
//! use mira_core::software::SoftwareDevice;
//! use mira_image::Image;
//!
//! # fn main() -> mira_core::Result<()> {
//! let gpu = AcceleratorDevice::new(Box::new(SoftwareDevice::new("gpu0")));
//! let image = Image::new_2d(64, 64, DataType::Uint8, 1)?;
//!
//! {
//!     let mut pixels = image.write_host()?;
//!     pixels.fill(128);
//! } // write released here
//!
//! // First device read allocates on gpu0 and uploads from host.
//! let _access = image.read_device_image(&gpu)?;
//! # Ok(()) }
//! ```

pub mod access;
pub mod image;
pub mod residency;
mod transfer;

pub use access::{DeviceBufferAccess, DeviceImageAccess, HostAccess, HostAccessMut};
pub use image::Image;
pub use residency::{AccessMode, Location};
