//! Session-wide pipeline and shader-module caches.
//!
//! The pool is a plain owned value passed to the pipeline manager by `&mut`.
//! Entries are never evicted within a session; the hit/miss counters are the
//! signal for tuning that later.

use std::collections::HashMap;

use crate::handle::{PipelineHandle, ShaderModuleHandle};
use crate::pipeline::RenderPipelineDescriptor;

/// Cache effectiveness counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub pipelines: usize,
    pub shader_modules: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Fraction of lookups served from the cache, 0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Descriptor-indexed pipeline cache plus a source-indexed module cache.
#[derive(Debug, Default)]
pub struct ResourcePool {
    pipelines: HashMap<RenderPipelineDescriptor, PipelineHandle>,
    shader_modules: HashMap<String, ShaderModuleHandle>,
    hits: u64,
    misses: u64,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a pipeline, counting the hit or miss.
    pub fn lookup_pipeline(&mut self, descriptor: &RenderPipelineDescriptor) -> Option<PipelineHandle> {
        match self.pipelines.get(descriptor) {
            Some(handle) => {
                self.hits += 1;
                Some(*handle)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert_pipeline(&mut self, descriptor: RenderPipelineDescriptor, handle: PipelineHandle) {
        self.pipelines.insert(descriptor, handle);
    }

    /// Forget a pipeline that was disposed explicitly.
    pub fn remove_pipeline(&mut self, handle: PipelineHandle) -> bool {
        let before = self.pipelines.len();
        self.pipelines.retain(|_, cached| *cached != handle);
        self.pipelines.len() != before
    }

    pub fn shader_module(&self, source: &str) -> Option<ShaderModuleHandle> {
        self.shader_modules.get(source).copied()
    }

    pub fn insert_shader_module(&mut self, source: &str, handle: ShaderModuleHandle) {
        self.shader_modules.insert(source.to_string(), handle);
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    pub fn shader_module_count(&self) -> usize {
        self.shader_modules.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            pipelines: self.pipelines.len(),
            shader_modules: self.shader_modules.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }

    /// Drop every entry. Counters survive.
    pub fn clear(&mut self) {
        self.pipelines.clear();
        self.shader_modules.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::BASIC_SHADER;
    use crate::types::TextureFormat;

    #[test]
    fn test_lookup_counts() {
        let mut pool = ResourcePool::new();
        let desc = RenderPipelineDescriptor::new(BASIC_SHADER, TextureFormat::Bgra8Unorm);

        assert_eq!(pool.lookup_pipeline(&desc), None);
        pool.insert_pipeline(desc.clone(), PipelineHandle(1));
        assert_eq!(pool.lookup_pipeline(&desc), Some(PipelineHandle(1)));

        let stats = pool.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut pool = ResourcePool::new();
        let desc = RenderPipelineDescriptor::new(BASIC_SHADER, TextureFormat::Bgra8Unorm);
        pool.insert_pipeline(desc, PipelineHandle(4));
        pool.insert_shader_module(BASIC_SHADER, ShaderModuleHandle(2));

        assert!(pool.remove_pipeline(PipelineHandle(4)));
        assert!(!pool.remove_pipeline(PipelineHandle(4)));
        assert_eq!(pool.shader_module(BASIC_SHADER), Some(ShaderModuleHandle(2)));

        pool.clear();
        assert_eq!(pool.shader_module_count(), 0);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
