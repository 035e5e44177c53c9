//! Vertex, index and uniform buffer management.
//!
//! The native APIs only validate sizes and alignment at submission time, if
//! at all, so every rule is checked here before a backend sees the call.

use crate::backend::NativeHandle;
use crate::device::GpuDevice;
use crate::error::{RenderError, RenderResult};
use crate::handle::{BufferHandle, HandleTable, ResourceKind};
use crate::types::{BufferDescriptor, BufferUsage, POSITION_COLOR_STRIDE_FLOATS};

/// Floats per interleaved vertex (position + color).
pub const VERTEX_STRIDE_FLOATS: usize = POSITION_COLOR_STRIDE_FLOATS;
/// Indices per triangle.
pub const INDICES_PER_TRIANGLE: usize = 3;
/// One 4x4 `f32` matrix.
pub const MIN_UNIFORM_BUFFER_SIZE: u64 = 64;
/// Required alignment of uniform writes.
pub const UNIFORM_WRITE_ALIGNMENT: u64 = 16;

/// What a live buffer is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub kind: ResourceKind,
    pub size: u64,
    pub usage: BufferUsage,
    pub label: Option<String>,
}

struct BufferRecord {
    native: NativeHandle,
    info: BufferInfo,
}

const WHAT: &str = "buffer";

/// Owns every buffer created through it.
#[derive(Default)]
pub struct BufferManager {
    buffers: HandleTable<BufferRecord>,
    allocated_bytes: u64,
}

impl BufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upload interleaved position + color vertices.
    pub fn create_vertex_buffer(
        &mut self,
        device: &mut GpuDevice,
        data: &[f32],
    ) -> RenderResult<BufferHandle> {
        if data.is_empty() {
            return Err(RenderError::InvalidArgument("vertex data is empty".into()));
        }
        if data.len() % VERTEX_STRIDE_FLOATS != 0 {
            return Err(RenderError::InvalidArgument(format!(
                "vertex data has {} floats, not a multiple of the {}-float stride",
                data.len(),
                VERTEX_STRIDE_FLOATS
            )));
        }
        self.create_with_contents(
            device,
            ResourceKind::Vertex,
            BufferUsage::VERTEX | BufferUsage::COPY_DST,
            "vertex buffer",
            bytemuck::cast_slice(data),
        )
    }

    /// Upload a triangle-list index buffer.
    pub fn create_index_buffer(
        &mut self,
        device: &mut GpuDevice,
        data: &[u32],
    ) -> RenderResult<BufferHandle> {
        if data.is_empty() {
            return Err(RenderError::InvalidArgument("index data is empty".into()));
        }
        if data.len() % INDICES_PER_TRIANGLE != 0 {
            return Err(RenderError::InvalidArgument(format!(
                "index data has {} indices, not a multiple of {}",
                data.len(),
                INDICES_PER_TRIANGLE
            )));
        }
        self.create_with_contents(
            device,
            ResourceKind::Index,
            BufferUsage::INDEX | BufferUsage::COPY_DST,
            "index buffer",
            bytemuck::cast_slice(data),
        )
    }

    /// Allocate a zeroed uniform buffer of at least 64 bytes.
    pub fn create_uniform_buffer(
        &mut self,
        device: &mut GpuDevice,
        size: u64,
    ) -> RenderResult<BufferHandle> {
        if size < MIN_UNIFORM_BUFFER_SIZE {
            return Err(RenderError::InvalidArgument(format!(
                "uniform buffer of {} bytes is below the {}-byte minimum",
                size, MIN_UNIFORM_BUFFER_SIZE
            )));
        }
        let descriptor = BufferDescriptor::new(size, BufferUsage::UNIFORM | BufferUsage::COPY_DST)
            .with_label("uniform buffer");
        self.allocate(device, ResourceKind::Uniform, descriptor, None)
    }

    /// Queue a write into a uniform buffer.
    ///
    /// Ordered before the next submission; no further synchronization.
    /// Vertex and index buffers are immutable after upload.
    pub fn update_uniform_buffer(
        &mut self,
        device: &mut GpuDevice,
        handle: BufferHandle,
        data: &[u8],
        offset: u64,
    ) -> RenderResult<()> {
        let backend = device.backend_mut()?;
        let record = self.buffers.get(handle.0, WHAT)?;
        if record.info.kind != ResourceKind::Uniform {
            return Err(RenderError::InvalidHandle(format!(
                "{} is a {:?} buffer, not a uniform buffer",
                handle, record.info.kind
            )));
        }

        if offset % UNIFORM_WRITE_ALIGNMENT != 0 {
            return Err(RenderError::InvalidArgument(format!(
                "offset {} is not {}-byte aligned",
                offset, UNIFORM_WRITE_ALIGNMENT
            )));
        }
        let end = offset.checked_add(data.len() as u64);
        if end.map_or(true, |end| end > record.info.size) {
            return Err(RenderError::InvalidArgument(format!(
                "write of {} bytes at offset {} exceeds {} of {} bytes",
                data.len(),
                offset,
                handle,
                record.info.size
            )));
        }

        backend.write_buffer(record.native, offset, data)?;
        Ok(())
    }

    /// Release a buffer. A second destroy of the same handle is `InvalidHandle`.
    pub fn destroy_buffer(&mut self, device: &mut GpuDevice, handle: BufferHandle) -> RenderResult<()> {
        let backend = device.backend_mut()?;
        let record = self.buffers.destroy(handle.0, WHAT)?;
        backend.destroy_buffer(record.native);
        self.allocated_bytes = self.allocated_bytes.saturating_sub(record.info.size);
        log::trace!("Destroyed {} ({} bytes)", handle, record.info.size);
        Ok(())
    }

    pub fn buffer_info(&self, handle: BufferHandle) -> RenderResult<&BufferInfo> {
        Ok(&self.buffers.get(handle.0, WHAT)?.info)
    }

    pub fn is_live(&self, handle: BufferHandle) -> bool {
        self.buffers.is_live(handle.0)
    }

    /// Backend id behind `handle`.
    pub fn native(&self, handle: BufferHandle) -> RenderResult<NativeHandle> {
        Ok(self.buffers.get(handle.0, WHAT)?.native)
    }

    pub fn live_count(&self) -> usize {
        self.buffers.live_count()
    }

    /// Bytes held by live buffers.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    /// Release every buffer after waiting for the device to go idle.
    pub fn dispose_all(&mut self, device: &mut GpuDevice) -> RenderResult<usize> {
        let backend = device.backend_mut()?;
        backend.wait_idle()?;
        let released = self.buffers.destroy_all();
        for (_, record) in &released {
            backend.destroy_buffer(record.native);
        }
        self.allocated_bytes = 0;
        Ok(released.len())
    }

    /// Tombstone every buffer without touching the (lost) device.
    pub fn invalidate_all(&mut self) -> usize {
        self.allocated_bytes = 0;
        self.buffers.destroy_all().len()
    }

    fn create_with_contents(
        &mut self,
        device: &mut GpuDevice,
        kind: ResourceKind,
        usage: BufferUsage,
        label: &str,
        contents: &[u8],
    ) -> RenderResult<BufferHandle> {
        let descriptor = BufferDescriptor::new(contents.len() as u64, usage).with_label(label);
        self.allocate(device, kind, descriptor, Some(contents))
    }

    fn allocate(
        &mut self,
        device: &mut GpuDevice,
        kind: ResourceKind,
        descriptor: BufferDescriptor,
        contents: Option<&[u8]>,
    ) -> RenderResult<BufferHandle> {
        let max = device.limits().max_buffer_size;
        if descriptor.size > max {
            return Err(RenderError::InvalidArgument(format!(
                "buffer size {} exceeds maximum {}",
                descriptor.size, max
            )));
        }

        let backend = device.backend_mut()?;
        let native = backend.create_buffer(&descriptor, contents)?;

        self.allocated_bytes += descriptor.size;
        let id = self.buffers.insert(BufferRecord {
            native,
            info: BufferInfo {
                kind,
                size: descriptor.size,
                usage: descriptor.usage,
                label: descriptor.label,
            },
        });
        log::trace!("Created {:?} buffer#{} ({} bytes)", kind, id, descriptor.size);
        Ok(BufferHandle(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (GpuDevice, BufferManager) {
        (GpuDevice::headless(64, 64), BufferManager::new())
    }

    #[test]
    fn test_vertex_stride_validation() {
        let (mut device, mut buffers) = setup();

        assert!(buffers.create_vertex_buffer(&mut device, &[0.0; 18]).is_ok());
        for len in [0usize, 1, 5, 7, 17] {
            let data = vec![0.0f32; len];
            assert!(
                matches!(
                    buffers.create_vertex_buffer(&mut device, &data),
                    Err(RenderError::InvalidArgument(_))
                ),
                "length {} should be rejected",
                len
            );
        }
    }

    #[test]
    fn test_index_validation() {
        let (mut device, mut buffers) = setup();

        let handle = buffers.create_index_buffer(&mut device, &[0, 1, 2]).unwrap();
        let info = buffers.buffer_info(handle).unwrap();
        assert_eq!(info.kind, ResourceKind::Index);
        assert_eq!(info.size, 12);
        assert_eq!(info.usage, BufferUsage::INDEX | BufferUsage::COPY_DST);

        assert!(buffers.create_index_buffer(&mut device, &[]).is_err());
        assert!(buffers.create_index_buffer(&mut device, &[0, 1]).is_err());
    }

    #[test]
    fn test_uniform_minimum_size() {
        let (mut device, mut buffers) = setup();
        assert!(buffers.create_uniform_buffer(&mut device, 63).is_err());
        assert!(buffers.create_uniform_buffer(&mut device, 64).is_ok());
    }

    #[test]
    fn test_update_alignment_and_bounds() {
        let (mut device, mut buffers) = setup();
        let handle = buffers.create_uniform_buffer(&mut device, 64).unwrap();

        assert!(buffers
            .update_uniform_buffer(&mut device, handle, &[0u8; 64], 0)
            .is_ok());
        assert!(buffers
            .update_uniform_buffer(&mut device, handle, &[0u8; 16], 48)
            .is_ok());
        assert!(matches!(
            buffers.update_uniform_buffer(&mut device, handle, &[0u8; 16], 8),
            Err(RenderError::InvalidArgument(_))
        ));
        assert!(matches!(
            buffers.update_uniform_buffer(&mut device, handle, &[0u8; 32], 48),
            Err(RenderError::InvalidArgument(_))
        ));
        assert!(matches!(
            buffers.update_uniform_buffer(&mut device, BufferHandle::NULL, &[0u8; 16], 0),
            Err(RenderError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_update_rejects_vertex_and_index_buffers() {
        let (mut device, mut buffers) = setup();
        let vertices = buffers.create_vertex_buffer(&mut device, &[0.0; 18]).unwrap();
        let indices = buffers.create_index_buffer(&mut device, &[0, 1, 2]).unwrap();

        assert!(matches!(
            buffers.update_uniform_buffer(&mut device, vertices, &[0u8; 16], 0),
            Err(RenderError::InvalidHandle(_))
        ));
        assert!(matches!(
            buffers.update_uniform_buffer(&mut device, indices, &[0u8; 4], 0),
            Err(RenderError::InvalidHandle(_))
        ));
        assert_eq!(buffers.live_count(), 2);
    }

    #[test]
    fn test_double_destroy() {
        let (mut device, mut buffers) = setup();
        let handle = buffers.create_uniform_buffer(&mut device, 128).unwrap();
        assert_eq!(buffers.allocated_bytes(), 128);

        buffers.destroy_buffer(&mut device, handle).unwrap();
        assert_eq!(buffers.allocated_bytes(), 0);
        assert!(matches!(
            buffers.destroy_buffer(&mut device, handle),
            Err(RenderError::InvalidHandle(_))
        ));
        assert!(matches!(
            buffers.update_uniform_buffer(&mut device, handle, &[0u8; 16], 0),
            Err(RenderError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_operations_fail_while_lost() {
        let (mut device, mut buffers) = setup();
        let handle = buffers.create_uniform_buffer(&mut device, 64).unwrap();

        device.force_loss("test");
        assert_eq!(
            buffers.create_vertex_buffer(&mut device, &[0.0; 6]),
            Err(RenderError::DeviceLost)
        );
        assert_eq!(
            buffers.update_uniform_buffer(&mut device, handle, &[0u8; 16], 0),
            Err(RenderError::DeviceLost)
        );
    }

    #[test]
    fn test_invalidate_all() {
        let (mut device, mut buffers) = setup();
        let a = buffers.create_uniform_buffer(&mut device, 64).unwrap();
        buffers.create_vertex_buffer(&mut device, &[0.0; 6]).unwrap();

        assert_eq!(buffers.invalidate_all(), 2);
        assert_eq!(buffers.live_count(), 0);
        assert_eq!(buffers.allocated_bytes(), 0);
        assert!(!buffers.is_live(a));
    }
}
