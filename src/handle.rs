//! Typed resource handles and the tombstoning table behind every manager.
//!
//! A handle is a plain `Copy` id. The record it names lives in a
//! [`HandleTable`] owned by the manager that created it, so callers only ever
//! hold a reference. Id `0` is the null handle and is never allocated, and ids
//! are never reused: once a slot is destroyed it stays destroyed.

use std::collections::HashMap;
use std::fmt;

use static_assertions::assert_impl_all;

use crate::error::{RenderError, RenderResult};

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// The null handle. Never refers to a record.
            pub const NULL: Self = Self(0);

            pub fn id(&self) -> u64 {
                self.0
            }

            pub fn is_null(&self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }
    };
}

define_handle!(
    /// Handle to a vertex, index or uniform buffer.
    BufferHandle,
    "buffer"
);
define_handle!(
    /// Handle to a texture.
    TextureHandle,
    "texture"
);
define_handle!(
    /// Handle to a texture view. Destroyed together with its texture.
    TextureViewHandle,
    "texture-view"
);
define_handle!(
    /// Handle to a cached render pipeline.
    PipelineHandle,
    "pipeline"
);
define_handle!(
    /// Handle to a compiled shader module.
    ShaderModuleHandle,
    "shader-module"
);

assert_impl_all!(BufferHandle: Copy, Send, Sync);
assert_impl_all!(TextureHandle: Copy, Send, Sync);
assert_impl_all!(TextureViewHandle: Copy, Send, Sync);
assert_impl_all!(PipelineHandle: Copy, Send, Sync);
assert_impl_all!(ShaderModuleHandle: Copy, Send, Sync);

/// What a resource record was created as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Vertex,
    Index,
    Uniform,
    Texture,
    TextureView,
    Pipeline,
    ShaderModule,
}

/// Any handle, tagged with its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceHandle {
    Buffer(BufferHandle),
    Texture(TextureHandle),
    TextureView(TextureViewHandle),
    Pipeline(PipelineHandle),
    ShaderModule(ShaderModuleHandle),
}

impl ResourceHandle {
    pub fn as_buffer(&self) -> Option<BufferHandle> {
        match self {
            ResourceHandle::Buffer(h) => Some(*h),
            _ => None,
        }
    }

    pub fn as_texture(&self) -> Option<TextureHandle> {
        match self {
            ResourceHandle::Texture(h) => Some(*h),
            _ => None,
        }
    }

    pub fn as_texture_view(&self) -> Option<TextureViewHandle> {
        match self {
            ResourceHandle::TextureView(h) => Some(*h),
            _ => None,
        }
    }

    pub fn as_pipeline(&self) -> Option<PipelineHandle> {
        match self {
            ResourceHandle::Pipeline(h) => Some(*h),
            _ => None,
        }
    }

    pub fn as_shader_module(&self) -> Option<ShaderModuleHandle> {
        match self {
            ResourceHandle::ShaderModule(h) => Some(*h),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            ResourceHandle::Buffer(h) => h.is_null(),
            ResourceHandle::Texture(h) => h.is_null(),
            ResourceHandle::TextureView(h) => h.is_null(),
            ResourceHandle::Pipeline(h) => h.is_null(),
            ResourceHandle::ShaderModule(h) => h.is_null(),
        }
    }
}

impl From<BufferHandle> for ResourceHandle {
    fn from(h: BufferHandle) -> Self {
        ResourceHandle::Buffer(h)
    }
}

impl From<TextureHandle> for ResourceHandle {
    fn from(h: TextureHandle) -> Self {
        ResourceHandle::Texture(h)
    }
}

impl From<TextureViewHandle> for ResourceHandle {
    fn from(h: TextureViewHandle) -> Self {
        ResourceHandle::TextureView(h)
    }
}

impl From<PipelineHandle> for ResourceHandle {
    fn from(h: PipelineHandle) -> Self {
        ResourceHandle::Pipeline(h)
    }
}

impl From<ShaderModuleHandle> for ResourceHandle {
    fn from(h: ShaderModuleHandle) -> Self {
        ResourceHandle::ShaderModule(h)
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceHandle::Buffer(h) => h.fmt(f),
            ResourceHandle::Texture(h) => h.fmt(f),
            ResourceHandle::TextureView(h) => h.fmt(f),
            ResourceHandle::Pipeline(h) => h.fmt(f),
            ResourceHandle::ShaderModule(h) => h.fmt(f),
        }
    }
}

enum Slot<T> {
    Live(T),
    Destroyed,
}

/// Id-indexed record storage with tombstones.
pub(crate) struct HandleTable<T> {
    next_id: u64,
    slots: HashMap<u64, Slot<T>>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            slots: HashMap::new(),
        }
    }

    /// Store a record and return its fresh id.
    pub fn insert(&mut self, record: T) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.insert(id, Slot::Live(record));
        id
    }

    pub fn get(&self, id: u64, what: &str) -> RenderResult<&T> {
        match self.slots.get(&id) {
            Some(Slot::Live(record)) => Ok(record),
            other => Err(Self::lookup_error(id, what, other.is_some())),
        }
    }

    pub fn get_mut(&mut self, id: u64, what: &str) -> RenderResult<&mut T> {
        match self.slots.get_mut(&id) {
            Some(Slot::Live(record)) => Ok(record),
            other => {
                let known = other.is_some();
                Err(Self::lookup_error(id, what, known))
            }
        }
    }

    /// Tombstone a live record and hand it back for native release.
    pub fn destroy(&mut self, id: u64, what: &str) -> RenderResult<T> {
        let known = self.slots.contains_key(&id);
        match self
            .slots
            .get_mut(&id)
            .map(|slot| std::mem::replace(slot, Slot::Destroyed))
        {
            Some(Slot::Live(record)) => Ok(record),
            _ => Err(Self::lookup_error(id, what, known)),
        }
    }

    /// Tombstone every live record, returning them.
    pub fn destroy_all(&mut self) -> Vec<(u64, T)> {
        let mut released = Vec::new();
        for (id, slot) in self.slots.iter_mut() {
            if let Slot::Live(record) = std::mem::replace(slot, Slot::Destroyed) {
                released.push((*id, record));
            }
        }
        released.sort_by_key(|(id, _)| *id);
        released
    }

    pub fn is_live(&self, id: u64) -> bool {
        matches!(self.slots.get(&id), Some(Slot::Live(_)))
    }

    pub fn live_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (u64, &T)> {
        self.slots.iter().filter_map(|(id, slot)| match slot {
            Slot::Live(record) => Some((*id, record)),
            Slot::Destroyed => None,
        })
    }

    fn lookup_error(id: u64, what: &str, known: bool) -> RenderError {
        if id == 0 {
            RenderError::InvalidHandle(format!("null {what} handle"))
        } else if known {
            RenderError::InvalidHandle(format!("{what}#{id} was already destroyed"))
        } else {
            RenderError::InvalidHandle(format!("unknown {what}#{id}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handle() {
        assert!(BufferHandle::NULL.is_null());
        assert_eq!(BufferHandle::default(), BufferHandle::NULL);
        assert_eq!(BufferHandle(7).to_string(), "buffer#7");
    }

    #[test]
    fn test_tagged_union_accessors() {
        let handle: ResourceHandle = TextureHandle(3).into();
        assert_eq!(handle.as_texture(), Some(TextureHandle(3)));
        assert_eq!(handle.as_buffer(), None);
        assert_eq!(handle.as_pipeline(), None);
        assert!(!handle.is_null());
    }

    #[test]
    fn test_table_ids_start_at_one_and_never_repeat() {
        let mut table = HandleTable::new();
        let a = table.insert("a");
        let b = table.insert("b");
        assert_eq!(a, 1);
        assert_eq!(b, 2);

        table.destroy(a, "buffer").unwrap();
        let c = table.insert("c");
        assert_eq!(c, 3);
        assert_eq!(table.live_count(), 2);
    }

    #[test]
    fn test_tombstone_is_permanent() {
        let mut table = HandleTable::new();
        let id = table.insert(42u32);

        assert_eq!(table.destroy(id, "buffer").unwrap(), 42);
        assert!(!table.is_live(id));

        let err = table.destroy(id, "buffer").unwrap_err();
        assert!(matches!(err, RenderError::InvalidHandle(msg) if msg.contains("already destroyed")));
        assert!(table.get(id, "buffer").is_err());
    }

    #[test]
    fn test_null_and_unknown_lookups() {
        let table: HandleTable<u32> = HandleTable::new();
        assert!(matches!(
            table.get(0, "texture"),
            Err(RenderError::InvalidHandle(msg)) if msg.contains("null")
        ));
        assert!(matches!(
            table.get(99, "texture"),
            Err(RenderError::InvalidHandle(msg)) if msg.contains("unknown")
        ));
    }

    #[test]
    fn test_destroy_all() {
        let mut table = HandleTable::new();
        table.insert(1);
        table.insert(2);
        let released = table.destroy_all();
        assert_eq!(released, vec![(1, 1), (2, 2)]);
        assert_eq!(table.live_count(), 0);
        assert!(table.destroy_all().is_empty());
    }
}
