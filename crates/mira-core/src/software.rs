//! RAM-backed reference backend.
//!
//! `SoftwareDevice` implements [`DeviceBackend`] with plain heap
//! allocations. It exists for two reasons: it is the reference semantics a
//! real accelerator backend must match byte for byte, and it lets every test
//! above the device layer run without hardware. Capability quirks are
//! configurable so tests can simulate wide-format-only devices.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::device::{BufferHandle, DeviceBackend, DeviceCapabilities, ImageHandle};
use crate::error::{MiraError, Result};
use crate::types::ImageLayout;

pub struct SoftwareDevice {
    name: String,
    capabilities: DeviceCapabilities,
    store: Mutex<Store>,
}

#[derive(Default)]
struct Store {
    next_handle: u64,
    images: HashMap<u64, Vec<u8>>,
    buffers: HashMap<u64, Vec<u8>>,
}

impl SoftwareDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capabilities(name, DeviceCapabilities::default())
    }

    pub fn with_capabilities(name: impl Into<String>, capabilities: DeviceCapabilities) -> Self {
        Self { name: name.into(), capabilities, store: Mutex::new(Store::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        // Lock poisoning means a panic mid-operation; the store itself is
        // still structurally sound, so keep serving.
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn check_len(kind: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(MiraError::Device(format!(
            "{kind} size mismatch: allocation is {expected} bytes, transfer is {got}"
        )));
    }
    Ok(())
}

impl DeviceBackend for SoftwareDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn create_image(&self, layout: &ImageLayout) -> Result<ImageHandle> {
        let mut store = self.lock();
        store.next_handle += 1;
        let handle = store.next_handle;
        store.images.insert(handle, vec![0u8; layout.byte_len()]);
        Ok(ImageHandle(handle))
    }

    fn write_image(&self, handle: ImageHandle, layout: &ImageLayout, data: &[u8]) -> Result<()> {
        check_len("image", layout.byte_len(), data.len())?;
        let mut store = self.lock();
        let storage = store
            .images
            .get_mut(&handle.0)
            .ok_or_else(|| MiraError::Device(format!("unknown image handle {}", handle.0)))?;
        check_len("image", storage.len(), data.len())?;
        storage.copy_from_slice(data);
        Ok(())
    }

    fn read_image(&self, handle: ImageHandle, layout: &ImageLayout, out: &mut [u8]) -> Result<()> {
        check_len("image", layout.byte_len(), out.len())?;
        let store = self.lock();
        let storage = store
            .images
            .get(&handle.0)
            .ok_or_else(|| MiraError::Device(format!("unknown image handle {}", handle.0)))?;
        check_len("image", storage.len(), out.len())?;
        out.copy_from_slice(storage);
        Ok(())
    }

    fn destroy_image(&self, handle: ImageHandle) -> Result<()> {
        let mut store = self.lock();
        store
            .images
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| MiraError::Device(format!("unknown image handle {}", handle.0)))
    }

    fn create_buffer(&self, byte_len: usize) -> Result<BufferHandle> {
        let mut store = self.lock();
        store.next_handle += 1;
        let handle = store.next_handle;
        store.buffers.insert(handle, vec![0u8; byte_len]);
        Ok(BufferHandle(handle))
    }

    fn write_buffer(&self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        let mut store = self.lock();
        let storage = store
            .buffers
            .get_mut(&handle.0)
            .ok_or_else(|| MiraError::Device(format!("unknown buffer handle {}", handle.0)))?;
        check_len("buffer", storage.len(), data.len())?;
        storage.copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, handle: BufferHandle, out: &mut [u8]) -> Result<()> {
        let store = self.lock();
        let storage = store
            .buffers
            .get(&handle.0)
            .ok_or_else(|| MiraError::Device(format!("unknown buffer handle {}", handle.0)))?;
        check_len("buffer", storage.len(), out.len())?;
        out.copy_from_slice(storage);
        Ok(())
    }

    fn destroy_buffer(&self, handle: BufferHandle) -> Result<()> {
        let mut store = self.lock();
        store
            .buffers
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| MiraError::Device(format!("unknown buffer handle {}", handle.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, ImageDescriptor};

    fn layout_2d(w: u32, h: u32, channels: u32, storage_channels: u32) -> ImageLayout {
        ImageLayout {
            descriptor: ImageDescriptor::new_2d(w, h, DataType::Uint8, channels).unwrap(),
            storage_channels,
        }
    }

    #[test]
    fn image_round_trip_is_byte_exact() {
        let dev = SoftwareDevice::new("test");
        let layout = layout_2d(4, 4, 4, 4);
        let handle = dev.create_image(&layout).unwrap();

        let data: Vec<u8> = (0..layout.byte_len() as u32).map(|i| i as u8).collect();
        dev.write_image(handle, &layout, &data).unwrap();

        let mut out = vec![0u8; layout.byte_len()];
        dev.read_image(handle, &layout, &mut out).unwrap();
        assert_eq!(out, data);

        dev.destroy_image(handle).unwrap();
        assert!(dev.read_image(handle, &layout, &mut out).is_err());
    }

    #[test]
    fn fresh_allocations_are_zeroed() {
        let dev = SoftwareDevice::new("test");
        let handle = dev.create_buffer(16).unwrap();
        let mut out = vec![0xffu8; 16];
        dev.read_buffer(handle, &mut out).unwrap();
        assert_eq!(out, vec![0u8; 16]);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let dev = SoftwareDevice::new("test");
        let handle = dev.create_buffer(16).unwrap();
        let err = dev.write_buffer(handle, &[0u8; 8]).unwrap_err();
        assert_eq!(err.error_code(), 301);
    }
}
