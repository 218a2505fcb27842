//! Execution devices and the accelerator backend trait.
//!
//! The data layer never talks to a concrete accelerator API. It talks to
//! [`DeviceBackend`], a deliberately narrow allocate/read/write/free surface
//! over two storage kinds: image storage (optimized, possibly padded layout)
//! and buffer storage (plain linear bytes). Backends are injected by the
//! caller; there is no global device registry.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::types::ImageLayout;

/// Stable identity of an accelerator for residency bookkeeping.
///
/// Allocated from a process-wide counter so two different devices can never
/// alias each other's residency entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device-{}", self.0)
    }
}

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

impl DeviceId {
    fn next() -> Self {
        DeviceId(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Opaque handle to a device-side image allocation. Only meaningful to the
/// backend that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub u64);

/// Opaque handle to a device-side linear buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// What a backend can and cannot do, queried at wiring time.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCapabilities {
    /// Kernels on this device may write directly into 3D image storage.
    /// When false, 3D results go through buffer storage instead.
    pub supports_3d_image_writes: bool,
    /// Image storage supports 1- and 2-channel formats natively. When false,
    /// everything below 4 channels is stored 4-wide and padded in transit.
    pub supports_narrow_image_formats: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self { supports_3d_image_writes: true, supports_narrow_image_formats: true }
    }
}

/// The accelerator contract.
///
/// Implementations must be internally synchronized: calls may arrive from
/// multiple threads and the backend serializes its own command submission.
/// All transfers are synchronous; when a call returns, the bytes have landed.
pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> DeviceCapabilities;

    // ── Image storage ──
    fn create_image(&self, layout: &ImageLayout) -> Result<ImageHandle>;
    fn write_image(&self, handle: ImageHandle, layout: &ImageLayout, data: &[u8]) -> Result<()>;
    fn read_image(&self, handle: ImageHandle, layout: &ImageLayout, out: &mut [u8]) -> Result<()>;
    fn destroy_image(&self, handle: ImageHandle) -> Result<()>;

    // ── Buffer storage ──
    fn create_buffer(&self, byte_len: usize) -> Result<BufferHandle>;
    fn write_buffer(&self, handle: BufferHandle, data: &[u8]) -> Result<()>;
    fn read_buffer(&self, handle: BufferHandle, out: &mut [u8]) -> Result<()>;
    fn destroy_buffer(&self, handle: BufferHandle) -> Result<()>;
}

/// An accelerator wired into the pipeline: a backend plus its stable id.
pub struct AcceleratorDevice {
    id: DeviceId,
    backend: Box<dyn DeviceBackend>,
}

impl AcceleratorDevice {
    pub fn new(backend: Box<dyn DeviceBackend>) -> Arc<Self> {
        let device = Arc::new(Self { id: DeviceId::next(), backend });
        tracing::info!(id = %device.id, name = device.backend.name(), "accelerator device registered");
        device
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.backend.capabilities()
    }

    pub fn backend(&self) -> &dyn DeviceBackend {
        self.backend.as_ref()
    }

    /// Channel count the device will actually store for a logical channel
    /// count. Three channels always round up to four; one and two only on
    /// devices without narrow formats.
    pub fn storage_channels(&self, channels: u32) -> u32 {
        match channels {
            4 => 4,
            3 => 4,
            c if self.backend.capabilities().supports_narrow_image_formats => c,
            _ => 4,
        }
    }
}

impl fmt::Debug for AcceleratorDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceleratorDevice")
            .field("id", &self.id)
            .field("name", &self.backend.name())
            .finish()
    }
}

/// Where an operation runs: host CPU or a wired accelerator.
#[derive(Debug, Clone)]
pub enum ExecutionDevice {
    Host,
    Accelerator(Arc<AcceleratorDevice>),
}

impl ExecutionDevice {
    pub fn is_host(&self) -> bool {
        matches!(self, ExecutionDevice::Host)
    }

    pub fn accelerator(&self) -> Option<&Arc<AcceleratorDevice>> {
        match self {
            ExecutionDevice::Host => None,
            ExecutionDevice::Accelerator(device) => Some(device),
        }
    }
}

impl From<Arc<AcceleratorDevice>> for ExecutionDevice {
    fn from(device: Arc<AcceleratorDevice>) -> Self {
        ExecutionDevice::Accelerator(device)
    }
}
