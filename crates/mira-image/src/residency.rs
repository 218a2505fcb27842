//! Residency tracking: which copies of an image's pixels are current.
//!
//! Every image owns one [`ResidencyState`] behind a mutex. The state maps
//! each accelerator to an optional image allocation and an optional buffer
//! allocation, each with an up-to-date flag, plus the host array with its
//! flag. The rules:
//!
//! - allocations are created lazily, on the first access that needs them
//! - a read marks the target location up to date (transferring if needed)
//!   and leaves every other flag alone
//! - a write marks the target up to date and invalidates everything else
//! - once any data exists, at least one location is up to date at all times
//!
//! Collisions (read during write, write during anything) fail fast with
//! `ConcurrentAccess`; they are pipeline wiring bugs, never worth blocking
//! on.

use std::collections::HashMap;
use std::sync::Arc;

use mira_core::device::{BufferHandle, ImageHandle};
use mira_core::{AcceleratorDevice, DeviceId, ImageDescriptor, MiraError, Result};

use crate::transfer;

/// How an access guard may touch the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// A concrete place pixel data can live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Host,
    DeviceImage(DeviceId),
    DeviceBuffer(DeviceId),
}

pub(crate) struct ImageEntry {
    pub device: Arc<AcceleratorDevice>,
    pub handle: ImageHandle,
    pub up_to_date: bool,
}

pub(crate) struct BufferEntry {
    pub device: Arc<AcceleratorDevice>,
    pub handle: BufferHandle,
    pub up_to_date: bool,
}

pub(crate) struct ResidencyState {
    pub descriptor: Option<ImageDescriptor>,
    pub spacing: [f32; 3],
    pub host: Option<Arc<Vec<u8>>>,
    pub host_up_to_date: bool,
    pub device_images: HashMap<DeviceId, ImageEntry>,
    pub device_buffers: HashMap<DeviceId, BufferEntry>,
    pub readers: usize,
    pub writer_active: bool,
    pub intensity_cache: Option<(u64, IntensityStats)>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct IntensityStats {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
}

impl Default for ResidencyState {
    fn default() -> Self {
        Self {
            descriptor: None,
            spacing: [1.0, 1.0, 1.0],
            host: None,
            host_up_to_date: false,
            device_images: HashMap::new(),
            device_buffers: HashMap::new(),
            readers: 0,
            writer_active: false,
            intensity_cache: None,
        }
    }
}

impl ResidencyState {
    pub fn descriptor(&self) -> Result<ImageDescriptor> {
        self.descriptor.ok_or(MiraError::UninitializedData)
    }

    /// True once any location holds (possibly stale) pixel storage.
    pub fn has_any_data(&self) -> bool {
        self.host.is_some()
            || !self.device_images.is_empty()
            || !self.device_buffers.is_empty()
    }

    /// Every location currently marked up to date, host first.
    pub fn up_to_date_locations(&self) -> Vec<Location> {
        let mut locations = Vec::new();
        if self.host.is_some() && self.host_up_to_date {
            locations.push(Location::Host);
        }
        for (id, entry) in &self.device_images {
            if entry.up_to_date {
                locations.push(Location::DeviceImage(*id));
            }
        }
        for (id, entry) in &self.device_buffers {
            if entry.up_to_date {
                locations.push(Location::DeviceBuffer(*id));
            }
        }
        locations
    }

    // ── Access bookkeeping ──

    pub fn begin_read(&mut self) -> Result<()> {
        if self.writer_active {
            return Err(MiraError::ConcurrentAccess(
                "read access requested while a write access is held",
            ));
        }
        self.readers += 1;
        Ok(())
    }

    pub fn end_read(&mut self) {
        debug_assert!(self.readers > 0);
        self.readers = self.readers.saturating_sub(1);
    }

    pub fn begin_write(&mut self) -> Result<()> {
        if self.writer_active {
            return Err(MiraError::ConcurrentAccess(
                "write access requested while another write access is held",
            ));
        }
        if self.readers > 0 {
            return Err(MiraError::ConcurrentAccess(
                "write access requested while read accesses are held",
            ));
        }
        self.writer_active = true;
        Ok(())
    }

    pub fn end_write(&mut self) {
        debug_assert!(self.writer_active);
        self.writer_active = false;
    }

    /// Mark every location except `kept` out of date. Called when a write
    /// access is granted.
    pub fn invalidate_all_except(&mut self, kept: Location) {
        self.host_up_to_date = kept == Location::Host && self.host.is_some();
        for (id, entry) in &mut self.device_images {
            entry.up_to_date = kept == Location::DeviceImage(*id);
        }
        for (id, entry) in &mut self.device_buffers {
            entry.up_to_date = kept == Location::DeviceBuffer(*id);
        }
    }

    // ── Lazy allocation + transfer ──

    /// Make the host array current, allocating and downloading as needed.
    pub fn ensure_host(&mut self) -> Result<()> {
        let desc = self.descriptor()?;
        if self.host.is_some() && self.host_up_to_date {
            return Ok(());
        }
        let had_data = self.has_any_data();
        if self.host.is_none() {
            self.host = Some(Arc::new(vec![0u8; desc.host_byte_len()]));
        }
        if !had_data {
            // First allocation anywhere: the fresh zeroed array is the data.
            self.host_up_to_date = true;
            return Ok(());
        }
        if self.host_up_to_date {
            return Ok(());
        }

        // Stale host: pull from an up-to-date device copy, image storage
        // preferred over buffer storage.
        if let Some(entry) = self.device_images.values().find(|e| e.up_to_date) {
            let layout = transfer::layout_for(desc, &entry.device);
            let mut staged = vec![0u8; layout.byte_len()];
            entry.device.backend().read_image(entry.handle, &layout, &mut staged)?;
            tracing::debug!(device = %entry.device.id(), "downloaded image storage to host");
            self.host = Some(Arc::new(transfer::unpack_device_to_host(&layout, &staged)));
            self.host_up_to_date = true;
            return Ok(());
        }
        if let Some(entry) = self.device_buffers.values().find(|e| e.up_to_date) {
            let mut bytes = vec![0u8; desc.host_byte_len()];
            entry.device.backend().read_buffer(entry.handle, &mut bytes)?;
            tracing::debug!(device = %entry.device.id(), "downloaded buffer storage to host");
            self.host = Some(Arc::new(bytes));
            self.host_up_to_date = true;
            return Ok(());
        }
        Err(MiraError::NoValidSource)
    }

    /// Make the image allocation on `device` current. Inter-device moves are
    /// staged through the host array.
    pub fn ensure_device_image(&mut self, device: &Arc<AcceleratorDevice>) -> Result<ImageHandle> {
        let desc = self.descriptor()?;
        let id = device.id();
        if let Some(entry) = self.device_images.get(&id) {
            if entry.up_to_date {
                return Ok(entry.handle);
            }
        }
        let had_data = self.has_any_data();
        let layout = transfer::layout_for(desc, device);
        if !self.device_images.contains_key(&id) {
            let handle = device.backend().create_image(&layout)?;
            tracing::debug!(device = %id, bytes = layout.byte_len(), "allocated device image storage");
            self.device_images.insert(
                id,
                ImageEntry { device: Arc::clone(device), handle, up_to_date: false },
            );
        }
        let handle = self.device_images[&id].handle;
        if !had_data {
            self.set_image_up_to_date(id);
            return Ok(handle);
        }
        self.ensure_host()?;
        let host = self.host_bytes()?;
        let packed = transfer::pack_host_to_device(&layout, host);
        device.backend().write_image(handle, &layout, &packed)?;
        tracing::debug!(device = %id, "uploaded host data to device image storage");
        self.set_image_up_to_date(id);
        Ok(handle)
    }

    /// Make the buffer allocation on `device` current.
    pub fn ensure_device_buffer(&mut self, device: &Arc<AcceleratorDevice>) -> Result<BufferHandle> {
        let desc = self.descriptor()?;
        let id = device.id();
        if let Some(entry) = self.device_buffers.get(&id) {
            if entry.up_to_date {
                return Ok(entry.handle);
            }
        }
        let had_data = self.has_any_data();
        if !self.device_buffers.contains_key(&id) {
            let handle = device.backend().create_buffer(desc.host_byte_len())?;
            tracing::debug!(device = %id, bytes = desc.host_byte_len(), "allocated device buffer storage");
            self.device_buffers.insert(
                id,
                BufferEntry { device: Arc::clone(device), handle, up_to_date: false },
            );
        }
        let handle = self.device_buffers[&id].handle;
        if !had_data {
            self.set_buffer_up_to_date(id);
            return Ok(handle);
        }
        self.ensure_host()?;
        let host = self.host_bytes()?;
        device.backend().write_buffer(handle, host)?;
        tracing::debug!(device = %id, "uploaded host data to device buffer storage");
        self.set_buffer_up_to_date(id);
        Ok(handle)
    }

    fn set_image_up_to_date(&mut self, id: DeviceId) {
        if let Some(entry) = self.device_images.get_mut(&id) {
            entry.up_to_date = true;
        }
    }

    fn set_buffer_up_to_date(&mut self, id: DeviceId) {
        if let Some(entry) = self.device_buffers.get_mut(&id) {
            entry.up_to_date = true;
        }
    }

    fn host_bytes(&self) -> Result<&[u8]> {
        self.host.as_deref().map(|v| v.as_slice()).ok_or(MiraError::NoValidSource)
    }

    // ── Storage release ──

    /// Drop all allocations on one device. The host array is untouched.
    /// Both storage kinds are released even if one destroy fails; the first
    /// error is reported.
    pub fn free_device(&mut self, device: &Arc<AcceleratorDevice>) -> Result<()> {
        let id = device.id();
        let mut first_err = None;
        if let Some(entry) = self.device_images.remove(&id) {
            if let Err(e) = entry.device.backend().destroy_image(entry.handle) {
                first_err.get_or_insert(e);
            }
        }
        if let Some(entry) = self.device_buffers.remove(&id) {
            if let Err(e) = entry.device.backend().destroy_buffer(entry.handle) {
                first_err.get_or_insert(e);
            }
        }
        if self.has_any_data() && self.up_to_date_locations().is_empty() {
            tracing::warn!(device = %id, "freed the only up-to-date copy of an image");
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop the host array.
    pub fn free_host(&mut self) {
        self.host = None;
        self.host_up_to_date = false;
        if self.has_any_data() && self.up_to_date_locations().is_empty() {
            tracing::warn!("freed the only up-to-date copy of an image");
        }
    }

    /// Drop every allocation. The descriptor survives; the next access
    /// starts from fresh zeroed storage.
    pub fn free_all(&mut self) -> Result<()> {
        self.free_host();
        let mut first_err = None;
        for (_, entry) in self.device_images.drain() {
            if let Err(e) = entry.device.backend().destroy_image(entry.handle) {
                first_err.get_or_insert(e);
            }
        }
        for (_, entry) in self.device_buffers.drain() {
            if let Err(e) = entry.device.backend().destroy_buffer(entry.handle) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
