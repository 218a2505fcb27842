//! wgpu backend for the MIRA device layer.
//!
//! Implements `DeviceBackend` on top of a wgpu adapter: image storage as
//! textures in non-normalized formats, buffer storage as storage buffers,
//! plus a content-addressed shader-module cache for kernel code.
//!
//! ```no_run
//! use mira_wgpu::WgpuDevice;
//!
//! # fn main() -> mira_core::Result<()> {
//! let gpu = WgpuDevice::register()?;
//! println!("running on {}", gpu.name());
//! # Ok(()) }
//! ```

pub mod device;
pub mod format;

pub use device::WgpuDevice;
