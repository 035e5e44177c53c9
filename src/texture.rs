//! Texture and texture view management.

use crate::backend::NativeHandle;
use crate::device::GpuDevice;
use crate::error::{RenderError, RenderResult};
use crate::handle::{HandleTable, TextureHandle, TextureViewHandle};
use crate::types::{
    TextureDataLayout, TextureDescriptor, TextureDimension, TextureRegion, TextureViewDescriptor,
    TextureViewDimension, TextureViewInfo,
};

/// What a live texture is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureInfo {
    pub descriptor: TextureDescriptor,
    pub size_bytes: u64,
    pub view_count: usize,
}

struct TextureRecord {
    native: NativeHandle,
    descriptor: TextureDescriptor,
    size_bytes: u64,
    views: Vec<TextureViewHandle>,
}

struct ViewRecord {
    native: NativeHandle,
    texture: TextureHandle,
    info: TextureViewInfo,
}

const WHAT: &str = "texture";
const WHAT_VIEW: &str = "texture-view";

/// Owns every texture and view created through it.
#[derive(Default)]
pub struct TextureManager {
    textures: HandleTable<TextureRecord>,
    views: HandleTable<ViewRecord>,
    allocated_bytes: u64,
}

impl TextureManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_texture(
        &mut self,
        device: &mut GpuDevice,
        descriptor: &TextureDescriptor,
    ) -> RenderResult<TextureHandle> {
        validate_descriptor(device, descriptor)?;

        let backend = device.backend_mut()?;
        let native = backend.create_texture(descriptor)?;

        let size_bytes = descriptor.size_in_bytes();
        self.allocated_bytes += size_bytes;
        let id = self.textures.insert(TextureRecord {
            native,
            descriptor: descriptor.clone(),
            size_bytes,
            views: Vec::new(),
        });
        log::trace!(
            "Created texture#{} {:?} {}x{}x{} {:?}",
            id,
            descriptor.label,
            descriptor.width,
            descriptor.height,
            descriptor.depth_or_array_layers,
            descriptor.format
        );
        Ok(TextureHandle(id))
    }

    /// Upload tightly packed texels into mip 0, layer 0.
    pub fn upload(
        &mut self,
        device: &mut GpuDevice,
        handle: TextureHandle,
        data: &[u8],
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        self.upload_region(
            device,
            handle,
            data,
            TextureRegion {
                mip_level: 0,
                array_layer: 0,
                width,
                height,
            },
        )
    }

    /// Upload tightly packed texels into one mip level of one layer.
    ///
    /// Rows are `width * block_size` bytes with no padding.
    pub fn upload_region(
        &mut self,
        device: &mut GpuDevice,
        handle: TextureHandle,
        data: &[u8],
        region: TextureRegion,
    ) -> RenderResult<()> {
        if handle.is_null() {
            return Err(RenderError::InvalidState(
                "upload to a texture that was never created".into(),
            ));
        }
        let backend = device.backend_mut()?;
        let record = self.textures.get(handle.0, WHAT)?;
        let desc = &record.descriptor;

        if desc.format.is_depth() {
            return Err(RenderError::InvalidArgument(format!(
                "{:?} textures cannot be uploaded to",
                desc.format
            )));
        }
        if region.mip_level >= desc.mip_level_count
            || region.array_layer >= desc.depth_or_array_layers
        {
            return Err(RenderError::InvalidArgument(format!(
                "mip {} / layer {} is outside {}",
                region.mip_level, region.array_layer, handle
            )));
        }
        let mip_width = (desc.width >> region.mip_level).max(1);
        let mip_height = (desc.height >> region.mip_level).max(1);
        if region.width == 0
            || region.height == 0
            || region.width > mip_width
            || region.height > mip_height
        {
            return Err(RenderError::InvalidArgument(format!(
                "upload region {}x{} does not fit mip {} of {} ({}x{})",
                region.width, region.height, region.mip_level, handle, mip_width, mip_height
            )));
        }

        let bytes_per_row = region.width * desc.format.block_size();
        let required = bytes_per_row as usize * region.height as usize;
        if data.len() < required {
            return Err(RenderError::InvalidArgument(format!(
                "{} bytes of texel data, {} needed for {}x{} {:?}",
                data.len(),
                required,
                region.width,
                region.height,
                desc.format
            )));
        }

        let layout = TextureDataLayout {
            offset: 0,
            bytes_per_row,
            rows_per_image: region.height,
        };
        backend.write_texture(record.native, &region, &data[..required], &layout)?;
        Ok(())
    }

    /// Create a view. `None` views the whole texture with its natural
    /// dimension, so a cube texture gets a cube view.
    pub fn create_view(
        &mut self,
        device: &mut GpuDevice,
        handle: TextureHandle,
        descriptor: Option<&TextureViewDescriptor>,
    ) -> RenderResult<TextureViewHandle> {
        let backend = device.backend_mut()?;
        let record = self.textures.get(handle.0, WHAT)?;
        let info = resolve_view(&record.descriptor, descriptor)?;
        let native = backend.create_texture_view(record.native, &info)?;

        let view = TextureViewHandle(self.views.insert(ViewRecord {
            native,
            texture: handle,
            info,
        }));
        self.textures.get_mut(handle.0, WHAT)?.views.push(view);
        Ok(view)
    }

    /// Release a texture and every view of it.
    pub fn dispose(&mut self, device: &mut GpuDevice, handle: TextureHandle) -> RenderResult<()> {
        let backend = device.backend_mut()?;
        let record = self.textures.destroy(handle.0, WHAT)?;
        for view in &record.views {
            if let Ok(view_record) = self.views.destroy(view.0, WHAT_VIEW) {
                backend.destroy_texture_view(view_record.native);
            }
        }
        backend.destroy_texture(record.native);
        self.allocated_bytes = self.allocated_bytes.saturating_sub(record.size_bytes);
        log::trace!(
            "Disposed {} and {} views ({} bytes)",
            handle,
            record.views.len(),
            record.size_bytes
        );
        Ok(())
    }

    /// Release a single view. Its texture stays live.
    pub fn dispose_view(&mut self, device: &mut GpuDevice, view: TextureViewHandle) -> RenderResult<()> {
        let backend = device.backend_mut()?;
        let record = self.views.destroy(view.0, WHAT_VIEW)?;
        backend.destroy_texture_view(record.native);
        if let Ok(texture) = self.textures.get_mut(record.texture.0, WHAT) {
            texture.views.retain(|v| *v != view);
        }
        Ok(())
    }

    pub fn texture_info(&self, handle: TextureHandle) -> RenderResult<TextureInfo> {
        let record = self.textures.get(handle.0, WHAT)?;
        Ok(TextureInfo {
            descriptor: record.descriptor.clone(),
            size_bytes: record.size_bytes,
            view_count: record.views.len(),
        })
    }

    pub fn view_info(&self, view: TextureViewHandle) -> RenderResult<TextureViewInfo> {
        Ok(self.views.get(view.0, WHAT_VIEW)?.info)
    }

    pub fn is_live(&self, handle: TextureHandle) -> bool {
        self.textures.is_live(handle.0)
    }

    pub fn is_view_live(&self, view: TextureViewHandle) -> bool {
        self.views.is_live(view.0)
    }

    pub(crate) fn native_view(&self, view: TextureViewHandle) -> RenderResult<NativeHandle> {
        Ok(self.views.get(view.0, WHAT_VIEW)?.native)
    }

    pub fn live_count(&self) -> usize {
        self.textures.live_count()
    }

    pub fn live_view_count(&self) -> usize {
        self.views.live_count()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    /// Release everything after waiting for the device to go idle.
    pub fn dispose_all(&mut self, device: &mut GpuDevice) -> RenderResult<usize> {
        let backend = device.backend_mut()?;
        backend.wait_idle()?;
        for (_, view) in self.views.destroy_all() {
            backend.destroy_texture_view(view.native);
        }
        let released = self.textures.destroy_all();
        for (_, record) in &released {
            backend.destroy_texture(record.native);
        }
        self.allocated_bytes = 0;
        Ok(released.len())
    }

    /// Tombstone every texture and view without native calls.
    pub fn invalidate_all(&mut self) -> usize {
        self.views.destroy_all();
        self.allocated_bytes = 0;
        self.textures.destroy_all().len()
    }
}

fn validate_descriptor(device: &GpuDevice, desc: &TextureDescriptor) -> RenderResult<()> {
    let invalid = |reason: String| Err(RenderError::InvalidArgument(reason));

    if desc.width == 0 || desc.height == 0 {
        return invalid(format!("texture size {}x{} is empty", desc.width, desc.height));
    }
    if desc.depth_or_array_layers == 0 {
        return invalid("texture needs at least one layer".into());
    }
    if desc.mip_level_count == 0 {
        return invalid("texture needs at least one mip level".into());
    }
    if desc.sample_count == 0 {
        return invalid("texture needs at least one sample".into());
    }

    let limits = device.limits();
    let max_dim = limits.max_texture_dimension_2d;
    if desc.width > max_dim || desc.height > max_dim {
        return invalid(format!(
            "texture size {}x{} exceeds the device maximum {}",
            desc.width, desc.height, max_dim
        ));
    }
    if desc.depth_or_array_layers > limits.max_texture_array_layers {
        return invalid(format!(
            "{} layers exceed the device maximum {}",
            desc.depth_or_array_layers, limits.max_texture_array_layers
        ));
    }

    let max_mips = u32::BITS - desc.width.max(desc.height).leading_zeros();
    if desc.mip_level_count > max_mips {
        return invalid(format!(
            "{} mip levels requested, {}x{} allows {}",
            desc.mip_level_count, desc.width, desc.height, max_mips
        ));
    }
    if desc.sample_count > 1 && desc.mip_level_count > 1 {
        return invalid("multisampled textures cannot have mip levels".into());
    }

    match desc.dimension {
        TextureDimension::D2 if desc.depth_or_array_layers != 1 => {
            invalid("2D textures have exactly one layer".into())
        }
        TextureDimension::Cube if desc.depth_or_array_layers != 6 => {
            invalid("cube textures have exactly six layers".into())
        }
        TextureDimension::Cube if desc.width != desc.height => {
            invalid(format!("cube faces must be square, got {}x{}", desc.width, desc.height))
        }
        _ => Ok(()),
    }
}

fn resolve_view(
    texture: &TextureDescriptor,
    descriptor: Option<&TextureViewDescriptor>,
) -> RenderResult<TextureViewInfo> {
    let default = TextureViewDescriptor::default();
    let desc = descriptor.unwrap_or(&default);

    let dimension = desc
        .dimension
        .unwrap_or_else(|| TextureViewDimension::from(texture.dimension));
    let base_mip_level = desc.base_mip_level;
    let mip_level_count = desc
        .mip_level_count
        .unwrap_or(texture.mip_level_count.saturating_sub(base_mip_level));
    let base_array_layer = desc.base_array_layer;
    let array_layer_count = desc.array_layer_count.unwrap_or(match dimension {
        TextureViewDimension::D2 => 1,
        TextureViewDimension::Cube => 6,
        TextureViewDimension::D2Array => {
            texture.depth_or_array_layers.saturating_sub(base_array_layer)
        }
    });

    if mip_level_count == 0 || base_mip_level + mip_level_count > texture.mip_level_count {
        return Err(RenderError::InvalidArgument(format!(
            "view mips {}..{} outside the texture's {}",
            base_mip_level,
            base_mip_level + mip_level_count,
            texture.mip_level_count
        )));
    }
    if array_layer_count == 0
        || base_array_layer + array_layer_count > texture.depth_or_array_layers
    {
        return Err(RenderError::InvalidArgument(format!(
            "view layers {}..{} outside the texture's {}",
            base_array_layer,
            base_array_layer + array_layer_count,
            texture.depth_or_array_layers
        )));
    }
    match dimension {
        TextureViewDimension::D2 if array_layer_count != 1 => {
            return Err(RenderError::InvalidArgument(
                "2D views cover exactly one layer".into(),
            ));
        }
        TextureViewDimension::Cube if array_layer_count != 6 => {
            return Err(RenderError::InvalidArgument(
                "cube views cover exactly six layers".into(),
            ));
        }
        _ => {}
    }

    Ok(TextureViewInfo {
        format: desc.format.unwrap_or(texture.format),
        dimension,
        base_mip_level,
        mip_level_count,
        base_array_layer,
        array_layer_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TextureFormat;

    fn setup() -> (GpuDevice, TextureManager) {
        (GpuDevice::headless(64, 64), TextureManager::new())
    }

    #[test]
    fn test_create_validation() {
        let (mut device, mut textures) = setup();

        assert!(textures
            .create_texture(&mut device, &TextureDescriptor::new_2d(0, 4, TextureFormat::Rgba8Unorm))
            .is_err());
        assert!(textures
            .create_texture(
                &mut device,
                &TextureDescriptor::new_2d(4, 4, TextureFormat::Rgba8Unorm).with_mip_levels(4)
            )
            .is_err());
        assert!(textures
            .create_texture(&mut device, &TextureDescriptor::new_2d(16384, 4, TextureFormat::Rgba8Unorm))
            .is_err());

        let mut cube = TextureDescriptor::new_cube(8, TextureFormat::Rgba8Unorm);
        cube.height = 4;
        assert!(textures.create_texture(&mut device, &cube).is_err());

        let ok = textures
            .create_texture(
                &mut device,
                &TextureDescriptor::new_2d(4, 4, TextureFormat::Rgba8Unorm).with_mip_levels(3),
            )
            .unwrap();
        assert_eq!(textures.texture_info(ok).unwrap().size_bytes, (16 + 4 + 1) * 4);
    }

    #[test]
    fn test_upload_layout() {
        let (mut device, mut textures) = setup();
        let handle = textures
            .create_texture(&mut device, &TextureDescriptor::new_2d(4, 2, TextureFormat::Rgba8Unorm))
            .unwrap();

        assert!(textures.upload(&mut device, handle, &[0u8; 32], 4, 2).is_ok());
        assert!(matches!(
            textures.upload(&mut device, handle, &[0u8; 31], 4, 2),
            Err(RenderError::InvalidArgument(_))
        ));
        assert!(matches!(
            textures.upload(&mut device, handle, &[0u8; 64], 8, 2),
            Err(RenderError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_upload_handle_states() {
        let (mut device, mut textures) = setup();
        assert!(matches!(
            textures.upload(&mut device, TextureHandle::NULL, &[0u8; 4], 1, 1),
            Err(RenderError::InvalidState(_))
        ));

        let handle = textures
            .create_texture(&mut device, &TextureDescriptor::new_2d(1, 1, TextureFormat::Rgba8Unorm))
            .unwrap();
        textures.dispose(&mut device, handle).unwrap();
        assert!(matches!(
            textures.upload(&mut device, handle, &[0u8; 4], 1, 1),
            Err(RenderError::InvalidHandle(_))
        ));
        assert!(matches!(
            textures.dispose(&mut device, handle),
            Err(RenderError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_default_views() {
        let (mut device, mut textures) = setup();
        let cube = textures
            .create_texture(&mut device, &TextureDescriptor::new_cube(8, TextureFormat::Rgba8Unorm))
            .unwrap();
        let view = textures.create_view(&mut device, cube, None).unwrap();
        let info = textures.view_info(view).unwrap();
        assert_eq!(info.dimension, TextureViewDimension::Cube);
        assert_eq!(info.array_layer_count, 6);

        let array = textures
            .create_texture(
                &mut device,
                &TextureDescriptor::new_2d_array(8, 8, 4, TextureFormat::Rgba8Unorm),
            )
            .unwrap();
        let layer = textures
            .create_view(
                &mut device,
                array,
                Some(&TextureViewDescriptor {
                    dimension: Some(TextureViewDimension::D2),
                    base_array_layer: 2,
                    ..Default::default()
                }),
            )
            .unwrap();
        assert_eq!(textures.view_info(layer).unwrap().base_array_layer, 2);
    }

    #[test]
    fn test_views_die_with_texture() {
        let (mut device, mut textures) = setup();
        let handle = textures
            .create_texture(&mut device, &TextureDescriptor::new_2d(8, 8, TextureFormat::Rgba8Unorm))
            .unwrap();
        let a = textures.create_view(&mut device, handle, None).unwrap();
        let b = textures.create_view(&mut device, handle, None).unwrap();
        assert_eq!(textures.live_view_count(), 2);

        textures.dispose(&mut device, handle).unwrap();
        assert!(!textures.is_view_live(a));
        assert!(!textures.is_view_live(b));
        assert_eq!(textures.allocated_bytes(), 0);
    }
}
