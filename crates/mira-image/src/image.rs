//! The multi-device image data object.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use mira_core::{
    dispatch_data_type, AcceleratorDevice, DataType, ExecutionDevice, ImageDescriptor, MiraError,
    Result,
};

use crate::access::{DeviceBufferAccess, DeviceImageAccess, HostAccess, HostAccessMut};
use crate::residency::{AccessMode, ImageEntry, IntensityStats, Location, ResidencyState};
use crate::transfer;

/// An image whose pixels may be resident on the host and on any number of
/// accelerators at once.
///
/// Constructed uninitialized or via the `new_*` helpers; `create_2d` /
/// `create_3d` (re-)initialize the shape, releasing all previous storage.
/// All pixel access goes through the `read_*` / `write_*` guard methods.
pub struct Image {
    state: Mutex<ResidencyState>,
    timestamp: AtomicU64,
}

impl Image {
    /// A fresh image with no shape and no storage. Any access before
    /// `create_2d`/`create_3d` fails with `UninitializedData`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(ResidencyState::default()), timestamp: AtomicU64::new(0) })
    }

    pub fn new_2d(width: u32, height: u32, data_type: DataType, channels: u32) -> Result<Arc<Self>> {
        let image = Self::new();
        image.create_2d(width, height, data_type, channels)?;
        Ok(image)
    }

    pub fn new_3d(
        width: u32,
        height: u32,
        depth: u32,
        data_type: DataType,
        channels: u32,
    ) -> Result<Arc<Self>> {
        let image = Self::new();
        image.create_3d(width, height, depth, data_type, channels)?;
        Ok(image)
    }

    /// A 2D image initialized from a caller buffer. Only the target location
    /// (host, or the given accelerator's image storage) is up to date.
    pub fn new_2d_with_data(
        width: u32,
        height: u32,
        data_type: DataType,
        channels: u32,
        device: &ExecutionDevice,
        data: &[u8],
    ) -> Result<Arc<Self>> {
        let image = Self::new();
        image.initialize(ImageDescriptor::new_2d(width, height, data_type, channels)?, Some((device, data)))?;
        Ok(image)
    }

    pub fn new_3d_with_data(
        width: u32,
        height: u32,
        depth: u32,
        data_type: DataType,
        channels: u32,
        device: &ExecutionDevice,
        data: &[u8],
    ) -> Result<Arc<Self>> {
        let image = Self::new();
        image.initialize(
            ImageDescriptor::new_3d(width, height, depth, data_type, channels)?,
            Some((device, data)),
        )?;
        Ok(image)
    }

    pub fn create_2d(&self, width: u32, height: u32, data_type: DataType, channels: u32) -> Result<()> {
        self.initialize(ImageDescriptor::new_2d(width, height, data_type, channels)?, None)
    }

    pub fn create_3d(
        &self,
        width: u32,
        height: u32,
        depth: u32,
        data_type: DataType,
        channels: u32,
    ) -> Result<()> {
        self.initialize(ImageDescriptor::new_3d(width, height, depth, data_type, channels)?, None)
    }

    fn initialize(
        &self,
        descriptor: ImageDescriptor,
        source: Option<(&ExecutionDevice, &[u8])>,
    ) -> Result<()> {
        if let Some((_, data)) = source {
            if data.len() != descriptor.host_byte_len() {
                return Err(MiraError::InvalidDescriptor(format!(
                    "initial data is {} bytes, descriptor needs {}",
                    data.len(),
                    descriptor.host_byte_len()
                )));
            }
        }
        let mut state = self.lock_state();
        if state.readers > 0 || state.writer_active {
            return Err(MiraError::ConcurrentAccess(
                "image re-created while accesses are held",
            ));
        }
        state.free_all()?;
        state.descriptor = Some(descriptor);
        state.intensity_cache = None;
        if let Some((device, data)) = source {
            match device {
                ExecutionDevice::Host => {
                    state.host = Some(Arc::new(data.to_vec()));
                    state.host_up_to_date = true;
                }
                ExecutionDevice::Accelerator(dev) => {
                    let layout = transfer::layout_for(descriptor, dev);
                    let handle = dev.backend().create_image(&layout)?;
                    let packed = transfer::pack_host_to_device(&layout, data);
                    dev.backend().write_image(handle, &layout, &packed)?;
                    state.device_images.insert(
                        dev.id(),
                        ImageEntry { device: Arc::clone(dev), handle, up_to_date: true },
                    );
                }
            }
        }
        drop(state);
        self.bump_timestamp();
        Ok(())
    }

    // ── Metadata ──

    pub fn is_initialized(&self) -> bool {
        self.lock_state().descriptor.is_some()
    }

    pub fn descriptor(&self) -> Result<ImageDescriptor> {
        self.lock_state().descriptor()
    }

    pub fn width(&self) -> Result<u32> {
        Ok(self.descriptor()?.width)
    }

    pub fn height(&self) -> Result<u32> {
        Ok(self.descriptor()?.height)
    }

    pub fn depth(&self) -> Result<u32> {
        Ok(self.descriptor()?.depth)
    }

    pub fn dimensions(&self) -> Result<u8> {
        Ok(self.descriptor()?.dimensions)
    }

    pub fn channels(&self) -> Result<u32> {
        Ok(self.descriptor()?.channels)
    }

    pub fn data_type(&self) -> Result<DataType> {
        Ok(self.descriptor()?.data_type)
    }

    /// Physical size of one pixel along each axis, in millimeters.
    pub fn spacing(&self) -> [f32; 3] {
        self.lock_state().spacing
    }

    pub fn set_spacing(&self, spacing: [f32; 3]) {
        self.lock_state().spacing = spacing;
        self.bump_timestamp();
    }

    /// Monotonic modification counter. Bumped on creation and every write
    /// access grant; consumers poll it for change detection.
    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Every location currently holding an up-to-date copy. Once the image
    /// holds any data and no write access is held, this is never empty.
    pub fn up_to_date_locations(&self) -> Vec<Location> {
        self.lock_state().up_to_date_locations()
    }

    /// True once any location holds pixel storage.
    pub fn has_any_data(&self) -> bool {
        self.lock_state().has_any_data()
    }

    // ── Scoped access ──

    /// Read access to the host array. Allocates/downloads if the host copy
    /// is missing or stale.
    pub fn read_host(self: &Arc<Self>) -> Result<HostAccess> {
        let mut state = self.lock_state();
        state.begin_read()?;
        if let Err(e) = state.ensure_host() {
            state.end_read();
            return Err(e);
        }
        // ensure_host leaves host populated on success.
        let data = match &state.host {
            Some(arc) => Arc::clone(arc),
            None => {
                state.end_read();
                return Err(MiraError::NoValidSource);
            }
        };
        Ok(HostAccess::new(Arc::clone(self), data))
    }

    /// Exclusive write access to the host array. Every other location is
    /// invalidated when the guard is granted.
    pub fn write_host(self: &Arc<Self>) -> Result<HostAccessMut> {
        let mut state = self.lock_state();
        state.begin_write()?;
        if let Err(e) = state.ensure_host() {
            state.end_write();
            return Err(e);
        }
        state.invalidate_all_except(Location::Host);
        let data = match state.host.take() {
            Some(arc) => Arc::try_unwrap(arc).unwrap_or_else(|shared| (*shared).clone()),
            None => {
                state.end_write();
                return Err(MiraError::NoValidSource);
            }
        };
        drop(state);
        self.bump_timestamp();
        Ok(HostAccessMut::new(Arc::clone(self), data))
    }

    /// Read access to image storage on `device`.
    pub fn read_device_image(
        self: &Arc<Self>,
        device: &Arc<AcceleratorDevice>,
    ) -> Result<DeviceImageAccess> {
        let mut state = self.lock_state();
        state.begin_read()?;
        match state.ensure_device_image(device) {
            Ok(handle) => Ok(DeviceImageAccess::new(
                Arc::clone(self),
                Arc::clone(device),
                handle,
                AccessMode::Read,
            )),
            Err(e) => {
                state.end_read();
                Err(e)
            }
        }
    }

    /// Exclusive write access to image storage on `device`. Devices that
    /// cannot write into 3D image storage refuse volumes here; route those
    /// results through `write_device_buffer` instead.
    pub fn write_device_image(
        self: &Arc<Self>,
        device: &Arc<AcceleratorDevice>,
    ) -> Result<DeviceImageAccess> {
        let mut state = self.lock_state();
        let desc = state.descriptor()?;
        if desc.dimensions == 3 && !device.capabilities().supports_3d_image_writes {
            return Err(MiraError::Device(format!(
                "{} cannot write into 3D image storage, use buffer storage instead",
                device.name()
            )));
        }
        state.begin_write()?;
        let handle = match state.ensure_device_image(device) {
            Ok(handle) => handle,
            Err(e) => {
                state.end_write();
                return Err(e);
            }
        };
        state.invalidate_all_except(Location::DeviceImage(device.id()));
        drop(state);
        self.bump_timestamp();
        Ok(DeviceImageAccess::new(Arc::clone(self), Arc::clone(device), handle, AccessMode::Write))
    }

    /// Read access to buffer storage on `device`.
    pub fn read_device_buffer(
        self: &Arc<Self>,
        device: &Arc<AcceleratorDevice>,
    ) -> Result<DeviceBufferAccess> {
        let mut state = self.lock_state();
        state.begin_read()?;
        match state.ensure_device_buffer(device) {
            Ok(handle) => Ok(DeviceBufferAccess::new(
                Arc::clone(self),
                Arc::clone(device),
                handle,
                AccessMode::Read,
            )),
            Err(e) => {
                state.end_read();
                Err(e)
            }
        }
    }

    /// Exclusive write access to buffer storage on `device`.
    pub fn write_device_buffer(
        self: &Arc<Self>,
        device: &Arc<AcceleratorDevice>,
    ) -> Result<DeviceBufferAccess> {
        let mut state = self.lock_state();
        state.begin_write()?;
        let handle = match state.ensure_device_buffer(device) {
            Ok(handle) => handle,
            Err(e) => {
                state.end_write();
                return Err(e);
            }
        };
        state.invalidate_all_except(Location::DeviceBuffer(device.id()));
        drop(state);
        self.bump_timestamp();
        Ok(DeviceBufferAccess::new(Arc::clone(self), Arc::clone(device), handle, AccessMode::Write))
    }

    // ── Storage release ──

    /// Release all storage held on one execution device.
    pub fn free(&self, device: &ExecutionDevice) -> Result<()> {
        let mut state = self.lock_state();
        if state.readers > 0 || state.writer_active {
            return Err(MiraError::ConcurrentAccess("storage released while accesses are held"));
        }
        match device {
            ExecutionDevice::Host => {
                state.free_host();
                Ok(())
            }
            ExecutionDevice::Accelerator(dev) => state.free_device(dev),
        }
    }

    /// Release every allocation. The shape survives; the next access starts
    /// over from zeroed storage.
    pub fn free_all(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.readers > 0 || state.writer_active {
            return Err(MiraError::ConcurrentAccess("storage released while accesses are held"));
        }
        state.free_all()
    }

    // ── Intensity statistics ──

    /// Minimum and maximum scalar value over all pixels and channels,
    /// computed on the host copy and cached until the image changes.
    pub fn intensity_min_max(&self) -> Result<(f64, f64)> {
        let stats = self.intensity_stats()?;
        Ok((stats.min, stats.max))
    }

    /// Sum of all scalar values, host-computed, cached by timestamp.
    pub fn intensity_sum(&self) -> Result<f64> {
        Ok(self.intensity_stats()?.sum)
    }

    fn intensity_stats(&self) -> Result<IntensityStats> {
        let mut state = self.lock_state();
        if state.writer_active {
            return Err(MiraError::ConcurrentAccess(
                "intensity statistics requested while a write access is held",
            ));
        }
        let timestamp = self.timestamp();
        if let Some((cached_at, stats)) = state.intensity_cache {
            if cached_at == timestamp {
                return Ok(stats);
            }
        }
        state.ensure_host()?;
        let desc = state.descriptor()?;
        let host = match &state.host {
            Some(arc) => Arc::clone(arc),
            None => return Err(MiraError::NoValidSource),
        };
        let stats = dispatch_data_type!(desc.data_type, T => {
            let values: Vec<T> = bytemuck::pod_collect_to_vec(host.as_slice());
            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            let mut sum = 0.0;
            for &v in &values {
                let v = v as f64;
                min = min.min(v);
                max = max.max(v);
                sum += v;
            }
            IntensityStats { min, max, sum }
        });
        state.intensity_cache = Some((timestamp, stats));
        Ok(stats)
    }

    // ── Guard plumbing ──

    fn lock_state(&self) -> MutexGuard<'_, ResidencyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump_timestamp(&self) {
        self.timestamp.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_read_access(&self) {
        self.lock_state().end_read();
    }

    pub(crate) fn release_write_access(&self) {
        self.lock_state().end_write();
    }

    pub(crate) fn finish_host_write(&self, data: Vec<u8>) {
        let mut state = self.lock_state();
        state.host = Some(Arc::new(data));
        state.host_up_to_date = true;
        state.end_write();
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        // Best effort: release device allocations the owner never freed.
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, entry) in state.device_images.drain() {
            if let Err(e) = entry.device.backend().destroy_image(entry.handle) {
                tracing::debug!(error = %e, "failed to release device image storage on drop");
            }
        }
        for (_, entry) in state.device_buffers.drain() {
            if let Err(e) = entry.device.backend().destroy_buffer(entry.handle) {
                tracing::debug!(error = %e, "failed to release device buffer storage on drop");
            }
        }
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Image")
            .field("descriptor", &state.descriptor)
            .field("up_to_date", &state.up_to_date_locations())
            .field("timestamp", &self.timestamp())
            .finish()
    }
}
