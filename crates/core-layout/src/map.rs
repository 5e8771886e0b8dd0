//! The planner's memory map: tensors arranged into logical layers.
//!
//! A layer stands for one physical device footprint; regions on the same
//! layer coexist on device, regions on different layers time-share the same
//! bytes. The layout-planning model builds the map through
//! [`MemoryMapBuilder`] and publishes the frozen [`MemoryMap`] inside a
//! schedule bundle, where the executor reads per-tensor section and fragment
//! sizes and the exporters serialize it.

use serde::Serialize;
use std::collections::HashMap;

/// Planned placement of one tensor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Region {
    pub name: String,
    pub size: usize,
    /// Planned section sizes, front to back. Empty until tree generation.
    pub sections: Vec<usize>,
    pub fragment_size: usize,
}

impl Region {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
            sections: Vec::new(),
            fragment_size: 0,
        }
    }
}

/// One logical device footprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Layer {
    pub regions: Vec<String>,
    pub size: usize,
    pub requested_size: usize,
}

impl Layer {
    pub fn new(size: usize) -> Self {
        Self {
            regions: Vec::new(),
            size,
            requested_size: 0,
        }
    }

    pub fn submit(&mut self, name: impl Into<String>, size: usize) {
        self.regions.push(name.into());
        self.requested_size += size;
    }

    pub fn is_accommodatable(&self) -> bool {
        self.requested_size <= self.size
    }
}

/// Mutable map under construction by the planner.
#[derive(Debug, Clone, Default)]
pub struct MemoryMapBuilder {
    pub regions: HashMap<String, Region>,
    pub layers: Vec<Layer>,
    memory_size: usize,
    current_layer: usize,
}

impl MemoryMapBuilder {
    pub fn new(memory_size: usize) -> Self {
        Self {
            regions: HashMap::new(),
            layers: vec![Layer::new(memory_size)],
            memory_size,
            current_layer: 0,
        }
    }

    pub fn memory_size(&self) -> usize {
        self.memory_size
    }

    pub fn create_layer(&mut self) {
        self.layers.push(Layer::new(self.memory_size));
        self.current_layer += 1;
    }

    pub fn current_layer(&mut self) -> &mut Layer {
        &mut self.layers[self.current_layer]
    }

    /// Place a region on the current layer.
    pub fn submit_region(&mut self, region: Region) {
        self.layers[self.current_layer].submit(region.name.clone(), region.size);
        self.regions.insert(region.name.clone(), region);
    }

    pub fn build(self) -> MemoryMap {
        MemoryMap {
            regions: self.regions,
            layers: self.layers,
        }
    }
}

/// Frozen placement plan consumed by the executor and the exporters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryMap {
    regions: HashMap<String, Region>,
    layers: Vec<Layer>,
}

impl MemoryMap {
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn region(&self, tensor: &str) -> Option<&Region> {
        self.regions.get(tensor)
    }

    /// Regions in a stable (name-sorted) order for serialization.
    pub fn regions_sorted(&self) -> Vec<&Region> {
        let mut regions: Vec<&Region> = self.regions.values().collect();
        regions.sort_by(|a, b| a.name.cmp(&b.name));
        regions
    }

    pub fn sections_of(&self, tensor: &str) -> Option<&[usize]> {
        self.regions.get(tensor).map(|r| r.sections.as_slice())
    }

    pub fn fragment_size_of(&self, tensor: &str) -> usize {
        self.regions.get(tensor).map_or(0, |r| r.fragment_size)
    }

    /// All tensors with a non-zero planned fragment.
    pub fn fragment_info(&self) -> HashMap<String, usize> {
        self.regions
            .iter()
            .filter(|(_, r)| r.fragment_size != 0)
            .map(|(name, r)| (name.clone(), r.fragment_size))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_opens_layers_and_tracks_requests() {
        let mut builder = MemoryMapBuilder::new(1000);
        builder.submit_region(Region::new("a", 500));
        builder.submit_region(Region::new("b", 400));
        assert!(builder.current_layer().is_accommodatable());

        builder.create_layer();
        builder.submit_region(Region::new("c", 300));

        let map = builder.build();
        assert_eq!(map.layers().len(), 2);
        assert_eq!(map.layers()[0].requested_size, 900);
        assert_eq!(map.layers()[1].regions, ["c".to_string()]);
        assert_eq!(map.region("a").map(|r| r.size), Some(500));
    }

    #[test]
    fn fragment_info_filters_zero() {
        let mut builder = MemoryMapBuilder::new(1000);
        let mut a = Region::new("a", 500);
        a.fragment_size = 100;
        builder.submit_region(a);
        builder.submit_region(Region::new("b", 400));
        let map = builder.build();
        let info = map.fragment_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info.get("a"), Some(&100));
        assert_eq!(map.fragment_size_of("b"), 0);
    }
}
