//! `DeviceBackend` over a wgpu device.
//!
//! Image storage maps to textures, buffer storage to storage buffers. All
//! transfers are synchronous: writes go through the queue, reads stage
//! through a mapped readback buffer with `device.poll(Maintain::Wait)`.
//! wgpu requires 256-byte row alignment on texture-to-buffer copies, so
//! downloads go through a row-padded staging buffer that is compacted on
//! the way out.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};

use mira_core::device::{BufferHandle, DeviceBackend, DeviceCapabilities, ImageHandle};
use mira_core::{AcceleratorDevice, ImageLayout, MiraError, Result};

use crate::format;

const ROW_ALIGNMENT: usize = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize;

fn align_to(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

pub struct WgpuDevice {
    name: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    store: Mutex<Store>,
    shader_cache: Mutex<HashMap<u64, Arc<wgpu::ShaderModule>>>,
}

#[derive(Default)]
struct Store {
    next_handle: u64,
    textures: HashMap<u64, wgpu::Texture>,
    buffers: HashMap<u64, BufferEntry>,
}

struct BufferEntry {
    buffer: wgpu::Buffer,
    /// Requested length; the allocation is rounded up to the 4-byte copy
    /// alignment.
    logical_len: usize,
}

impl WgpuDevice {
    /// Open the preferred adapter and wire it up as an accelerator.
    pub fn register() -> Result<Arc<AcceleratorDevice>> {
        Ok(AcceleratorDevice::new(Box::new(Self::open()?)))
    }

    pub fn open() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| MiraError::Device("no compatible gpu adapter found".into()))?;
        let info = adapter.get_info();
        tracing::info!(name = %info.name, backend = ?info.backend, "opening wgpu adapter");

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("mira"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        ))
        .map_err(|e| MiraError::Device(format!("device request failed: {e}")))?;

        Ok(Self {
            name: info.name,
            device,
            queue,
            store: Mutex::new(Store::default()),
            shader_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Compile a WGSL module, or reuse the cached build of identical source.
    pub fn shader_module(&self, source: &str) -> Arc<wgpu::ShaderModule> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        source.hash(&mut hasher);
        let key = hasher.finish();

        let mut cache = self.shader_cache.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(cache.entry(key).or_insert_with(|| {
            tracing::debug!(key, "compiling shader module");
            Arc::new(self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: None,
                source: wgpu::ShaderSource::Wgsl(source.into()),
            }))
        }))
    }

    /// Create a texture view for binding an image allocation in a kernel.
    pub fn texture_view(&self, handle: ImageHandle) -> Result<wgpu::TextureView> {
        let store = self.lock();
        let texture = store
            .textures
            .get(&handle.0)
            .ok_or_else(|| MiraError::Device(format!("unknown image handle {}", handle.0)))?;
        Ok(texture.create_view(&wgpu::TextureViewDescriptor::default()))
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn extent(layout: &ImageLayout) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: layout.descriptor.width,
            height: layout.descriptor.height,
            depth_or_array_layers: layout.descriptor.depth,
        }
    }

    /// Block until a mapped readback of `buffer` completes, then hand the
    /// mapped range to `consume`.
    fn blocking_map_read(
        &self,
        buffer: &wgpu::Buffer,
        consume: impl FnOnce(&[u8]),
    ) -> Result<()> {
        let slice = buffer.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| MiraError::Device("readback mapping was dropped".into()))?
            .map_err(|e| MiraError::Device(format!("readback mapping failed: {e:?}")))?;
        consume(&slice.get_mapped_range());
        buffer.unmap();
        Ok(())
    }
}

impl DeviceBackend for WgpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> DeviceCapabilities {
        // Narrow non-normalized formats and 3D texture dimensions are part
        // of the wgpu core feature set.
        DeviceCapabilities { supports_3d_image_writes: true, supports_narrow_image_formats: true }
    }

    fn create_image(&self, layout: &ImageLayout) -> Result<ImageHandle> {
        let format = format::texture_format(layout.descriptor.data_type, layout.storage_channels)?;
        let dimension = if layout.descriptor.dimensions == 3 {
            wgpu::TextureDimension::D3
        } else {
            wgpu::TextureDimension::D2
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("mira-image"),
            size: Self::extent(layout),
            mip_level_count: 1,
            sample_count: 1,
            dimension,
            format,
            usage: wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let mut store = self.lock();
        store.next_handle += 1;
        let handle = store.next_handle;
        store.textures.insert(handle, texture);
        Ok(ImageHandle(handle))
    }

    fn write_image(&self, handle: ImageHandle, layout: &ImageLayout, data: &[u8]) -> Result<()> {
        if data.len() != layout.byte_len() {
            return Err(MiraError::Device(format!(
                "image upload is {} bytes, layout needs {}",
                data.len(),
                layout.byte_len()
            )));
        }
        let texel = format::texel_size(layout.descriptor.data_type, layout.storage_channels);
        let bytes_per_row = layout.descriptor.width as usize * texel;
        let store = self.lock();
        let texture = store
            .textures
            .get(&handle.0)
            .ok_or_else(|| MiraError::Device(format!("unknown image handle {}", handle.0)))?;
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row as u32),
                rows_per_image: Some(layout.descriptor.height),
            },
            Self::extent(layout),
        );
        drop(store);
        self.queue.submit([]);
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn read_image(&self, handle: ImageHandle, layout: &ImageLayout, out: &mut [u8]) -> Result<()> {
        if out.len() != layout.byte_len() {
            return Err(MiraError::Device(format!(
                "image download is {} bytes, layout needs {}",
                out.len(),
                layout.byte_len()
            )));
        }
        let texel = format::texel_size(layout.descriptor.data_type, layout.storage_channels);
        let tight_row = layout.descriptor.width as usize * texel;
        let padded_row = align_to(tight_row, ROW_ALIGNMENT);
        let rows = (layout.descriptor.height * layout.descriptor.depth) as usize;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("mira-image-readback"),
            size: (padded_row * rows) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        {
            let store = self.lock();
            let texture = store
                .textures
                .get(&handle.0)
                .ok_or_else(|| MiraError::Device(format!("unknown image handle {}", handle.0)))?;
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
            encoder.copy_texture_to_buffer(
                wgpu::ImageCopyTexture {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::ImageCopyBuffer {
                    buffer: &staging,
                    layout: wgpu::ImageDataLayout {
                        offset: 0,
                        bytes_per_row: Some(padded_row as u32),
                        rows_per_image: Some(layout.descriptor.height),
                    },
                },
                Self::extent(layout),
            );
            self.queue.submit([encoder.finish()]);
        }

        self.blocking_map_read(&staging, |mapped| {
            for row in 0..rows {
                let src = &mapped[row * padded_row..row * padded_row + tight_row];
                out[row * tight_row..(row + 1) * tight_row].copy_from_slice(src);
            }
        })
    }

    fn destroy_image(&self, handle: ImageHandle) -> Result<()> {
        let texture = self
            .lock()
            .textures
            .remove(&handle.0)
            .ok_or_else(|| MiraError::Device(format!("unknown image handle {}", handle.0)))?;
        texture.destroy();
        Ok(())
    }

    fn create_buffer(&self, byte_len: usize) -> Result<BufferHandle> {
        // Copy sizes must be 4-byte aligned; over-allocate and remember the
        // logical length.
        let padded = align_to(byte_len.max(1), wgpu::COPY_BUFFER_ALIGNMENT as usize);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("mira-buffer"),
            size: padded as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let mut store = self.lock();
        store.next_handle += 1;
        let handle = store.next_handle;
        store.buffers.insert(handle, BufferEntry { buffer, logical_len: byte_len });
        Ok(BufferHandle(handle))
    }

    fn write_buffer(&self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        let store = self.lock();
        let entry = store
            .buffers
            .get(&handle.0)
            .ok_or_else(|| MiraError::Device(format!("unknown buffer handle {}", handle.0)))?;
        if data.len() != entry.logical_len {
            return Err(MiraError::Device(format!(
                "buffer upload is {} bytes, allocation is {}",
                data.len(),
                entry.logical_len
            )));
        }
        let padded_len = entry.buffer.size() as usize;
        if data.len() == padded_len {
            self.queue.write_buffer(&entry.buffer, 0, data);
        } else {
            let mut padded = vec![0u8; padded_len];
            padded[..data.len()].copy_from_slice(data);
            self.queue.write_buffer(&entry.buffer, 0, &padded);
        }
        drop(store);
        self.queue.submit([]);
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn read_buffer(&self, handle: BufferHandle, out: &mut [u8]) -> Result<()> {
        let staging = {
            let store = self.lock();
            let entry = store
                .buffers
                .get(&handle.0)
                .ok_or_else(|| MiraError::Device(format!("unknown buffer handle {}", handle.0)))?;
            if out.len() != entry.logical_len {
                return Err(MiraError::Device(format!(
                    "buffer download is {} bytes, allocation is {}",
                    out.len(),
                    entry.logical_len
                )));
            }
            let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("mira-buffer-readback"),
                size: entry.buffer.size(),
                usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                mapped_at_creation: false,
            });
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
            encoder.copy_buffer_to_buffer(&entry.buffer, 0, &staging, 0, entry.buffer.size());
            self.queue.submit([encoder.finish()]);
            staging
        };
        self.blocking_map_read(&staging, |mapped| {
            out.copy_from_slice(&mapped[..out.len()]);
        })
    }

    fn destroy_buffer(&self, handle: BufferHandle) -> Result<()> {
        let entry = self
            .lock()
            .buffers
            .remove(&handle.0)
            .ok_or_else(|| MiraError::Device(format!("unknown buffer handle {}", handle.0)))?;
        entry.buffer.destroy();
        Ok(())
    }
}
