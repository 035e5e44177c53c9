//! Draw-call batching.
//!
//! Drawables that share a material, geometry type and render state are
//! grouped so the renderer binds each pipeline once per batch instead of once
//! per object.

use std::collections::HashMap;

use crate::scene::{Drawable, MaterialId, RenderStateBits};

/// What makes two drawables batch-compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub material: MaterialId,
    pub geometry_type: &'static str,
    pub render_state: RenderStateBits,
}

impl BatchKey {
    pub fn of(drawable: &Drawable) -> Self {
        Self {
            material: drawable.material.id,
            geometry_type: drawable.geometry.geometry_type,
            render_state: drawable.material.render_state,
        }
    }
}

/// Drawables sharing one [`BatchKey`], in the order they were added.
#[derive(Debug, Clone)]
pub struct MeshBatch {
    pub key: BatchKey,
    pub items: Vec<Drawable>,
}

impl MeshBatch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchingStats {
    pub total_meshes: usize,
    pub total_batches: usize,
    pub avg_meshes_per_batch: f32,
    /// `1 - batches / meshes`, 0 when there are no meshes.
    pub draw_call_reduction: f32,
}

#[derive(Debug, Default)]
pub struct DrawCallBatcher {
    batches: Vec<MeshBatch>,
    lookup: HashMap<BatchKey, usize>,
    total_meshes: usize,
}

impl DrawCallBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, drawable: Drawable) {
        self.total_meshes += 1;
        let key = BatchKey::of(&drawable);
        let index = match self.lookup.get(&key) {
            Some(&index) => index,
            None => {
                self.batches.push(MeshBatch {
                    key,
                    items: Vec::new(),
                });
                self.lookup.insert(key, self.batches.len() - 1);
                self.batches.len() - 1
            }
        };
        self.batches[index].items.push(drawable);
    }

    /// Batches in first-appearance order of their keys.
    pub fn batches(&self) -> &[MeshBatch] {
        &self.batches
    }

    pub fn clear(&mut self) {
        self.batches.clear();
        self.lookup.clear();
        self.total_meshes = 0;
    }

    pub fn stats(&self) -> BatchingStats {
        let total_batches = self.batches.len();
        let meshes = self.total_meshes as f32;
        BatchingStats {
            total_meshes: self.total_meshes,
            total_batches,
            avg_meshes_per_batch: if total_batches > 0 {
                meshes / total_batches as f32
            } else {
                0.0
            },
            draw_call_reduction: if self.total_meshes > 0 {
                1.0 - total_batches as f32 / meshes
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::scene::{Geometry, GeometryId, Material, ObjectId};

    fn drawable(id: u64, material: &Arc<Material>, geometry: &Arc<Geometry>) -> Drawable {
        Drawable::new(ObjectId(id), geometry.clone(), material.clone())
    }

    #[test]
    fn test_groups_by_key_in_first_appearance_order() {
        let red = Arc::new(Material::basic(MaterialId(1)));
        let blue = Arc::new(Material::basic(MaterialId(2)));
        let tri = Arc::new(Geometry::triangle(GeometryId(1)));
        let quad = Arc::new(Geometry::quad(GeometryId(2), [1.0, 0.0, 0.0]));

        let mut batcher = DrawCallBatcher::new();
        batcher.add(drawable(0, &blue, &tri));
        batcher.add(drawable(1, &red, &tri));
        batcher.add(drawable(2, &blue, &tri));
        batcher.add(drawable(3, &blue, &quad));
        batcher.add(drawable(4, &red, &tri));

        let batches = batcher.batches();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].key.material, MaterialId(2));
        assert_eq!(batches[0].key.geometry_type, "triangle");
        assert_eq!(
            batches[0].items.iter().map(|d| d.id).collect::<Vec<_>>(),
            vec![ObjectId(0), ObjectId(2)]
        );
        assert_eq!(batches[1].key.material, MaterialId(1));
        assert_eq!(batches[2].key.geometry_type, "quad");

        // Every mesh lands in exactly one batch.
        let placed: usize = batches.iter().map(MeshBatch::len).sum();
        assert_eq!(placed, 5);
    }

    #[test]
    fn test_render_state_splits_batches() {
        let tri = Arc::new(Geometry::triangle(GeometryId(1)));
        let depth = Arc::new(Material::basic(MaterialId(1)));
        let blended = Arc::new(Material::basic(MaterialId(1)).with_render_state(RenderStateBits::BLEND));

        let mut batcher = DrawCallBatcher::new();
        batcher.add(drawable(0, &depth, &tri));
        batcher.add(drawable(1, &blended, &tri));
        assert_eq!(batcher.batches().len(), 2);
    }

    #[test]
    fn test_stats_and_clear() {
        let material = Arc::new(Material::basic(MaterialId(1)));
        let tri = Arc::new(Geometry::triangle(GeometryId(1)));

        let mut batcher = DrawCallBatcher::new();
        assert_eq!(batcher.stats().draw_call_reduction, 0.0);
        for id in 0..4 {
            batcher.add(drawable(id, &material, &tri));
        }
        let stats = batcher.stats();
        assert_eq!((stats.total_meshes, stats.total_batches), (4, 1));
        assert!((stats.avg_meshes_per_batch - 4.0).abs() < f32::EPSILON);
        assert!((stats.draw_call_reduction - 0.75).abs() < f32::EPSILON);

        batcher.clear();
        assert_eq!(batcher.stats(), BatchingStats::default());
    }
}
