//! Scoped access guards.
//!
//! Every guard is move-only, pins its image alive through an `Arc`, and
//! releases its access claim exactly once when dropped. Host guards expose
//! the pixel bytes directly; device guards expose the backend handle so
//! kernel code can bind the allocation.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytemuck::Pod;
use mira_core::device::{BufferHandle, ImageHandle};
use mira_core::{AcceleratorDevice, MiraError, Result};

use crate::image::Image;
use crate::residency::AccessMode;

/// Shared read access to the host array.
pub struct HostAccess {
    image: Arc<Image>,
    data: Arc<Vec<u8>>,
}

impl HostAccess {
    pub(crate) fn new(image: Arc<Image>, data: Arc<Vec<u8>>) -> Self {
        Self { image, data }
    }

    /// Typed view of the pixel bytes.
    pub fn as_slice<T: Pod>(&self) -> Result<&[T]> {
        bytemuck::try_cast_slice(self.data.as_slice())
            .map_err(|e| MiraError::InvalidDescriptor(format!("host data cast failed: {e}")))
    }

    /// Typed copy of the pixel bytes. Never fails on alignment.
    pub fn to_vec<T: Pod>(&self) -> Vec<T> {
        bytemuck::pod_collect_to_vec(self.data.as_slice())
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }
}

impl Deref for HostAccess {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_slice()
    }
}

impl std::fmt::Debug for HostAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostAccess").field("len", &self.data.len()).finish()
    }
}

impl Drop for HostAccess {
    fn drop(&mut self) {
        self.image.release_read_access();
    }
}

/// Exclusive write access to the host array.
///
/// The pixel bytes are held by the guard while it lives and handed back to
/// the image on drop; the host copy stays the single up-to-date location.
pub struct HostAccessMut {
    image: Arc<Image>,
    data: Vec<u8>,
}

impl HostAccessMut {
    pub(crate) fn new(image: Arc<Image>, data: Vec<u8>) -> Self {
        Self { image, data }
    }

    pub fn as_slice<T: Pod>(&self) -> Result<&[T]> {
        bytemuck::try_cast_slice(self.data.as_slice())
            .map_err(|e| MiraError::InvalidDescriptor(format!("host data cast failed: {e}")))
    }

    pub fn as_slice_mut<T: Pod>(&mut self) -> Result<&mut [T]> {
        bytemuck::try_cast_slice_mut(self.data.as_mut_slice())
            .map_err(|e| MiraError::InvalidDescriptor(format!("host data cast failed: {e}")))
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }
}

impl Deref for HostAccessMut {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_slice()
    }
}

impl DerefMut for HostAccessMut {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }
}

impl std::fmt::Debug for HostAccessMut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostAccessMut").field("len", &self.data.len()).finish()
    }
}

impl Drop for HostAccessMut {
    fn drop(&mut self) {
        self.image.finish_host_write(std::mem::take(&mut self.data));
    }
}

/// Access to image storage on one accelerator.
pub struct DeviceImageAccess {
    image: Arc<Image>,
    device: Arc<AcceleratorDevice>,
    handle: ImageHandle,
    mode: AccessMode,
}

impl DeviceImageAccess {
    pub(crate) fn new(
        image: Arc<Image>,
        device: Arc<AcceleratorDevice>,
        handle: ImageHandle,
        mode: AccessMode,
    ) -> Self {
        Self { image, device, handle, mode }
    }

    /// Backend handle for binding the allocation in kernel code.
    pub fn handle(&self) -> ImageHandle {
        self.handle
    }

    pub fn device(&self) -> &Arc<AcceleratorDevice> {
        &self.device
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }
}

impl std::fmt::Debug for DeviceImageAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceImageAccess")
            .field("device", &self.device.id())
            .field("handle", &self.handle)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for DeviceImageAccess {
    fn drop(&mut self) {
        match self.mode {
            AccessMode::Read => self.image.release_read_access(),
            AccessMode::Write => self.image.release_write_access(),
        }
    }
}

/// Access to buffer storage on one accelerator.
pub struct DeviceBufferAccess {
    image: Arc<Image>,
    device: Arc<AcceleratorDevice>,
    handle: BufferHandle,
    mode: AccessMode,
}

impl DeviceBufferAccess {
    pub(crate) fn new(
        image: Arc<Image>,
        device: Arc<AcceleratorDevice>,
        handle: BufferHandle,
        mode: AccessMode,
    ) -> Self {
        Self { image, device, handle, mode }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn device(&self) -> &Arc<AcceleratorDevice> {
        &self.device
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }
}

impl std::fmt::Debug for DeviceBufferAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBufferAccess")
            .field("device", &self.device.id())
            .field("handle", &self.handle)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for DeviceBufferAccess {
    fn drop(&mut self) {
        match self.mode {
            AccessMode::Read => self.image.release_read_access(),
            AccessMode::Write => self.image.release_write_access(),
        }
    }
}
