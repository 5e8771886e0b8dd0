//! Layout planning: packing tensors into time-sharing layers.
//!
//! When the static working set exceeds device capacity, tensors are arranged
//! into layers; tensors on one layer coexist on device while tensors on
//! different layers reuse the same bytes at different times. The model runs
//! three deterministic passes:
//!
//! 1. **Fill**: walk the execution order, appending aligned tensor
//!    footprints to the current layer, opening a new layer on overflow.
//! 2. **Fragment generation**: fixed-point pass that first resolves
//!    over-capacity layers by moving tensors from the bottom of the layer
//!    into its upper neighbour, then walks each adjacent pair with cumulative
//!    offsets, padding a lower tensor's fragment when its boundary falls just
//!    short (`δ < smin`) of an upper boundary. The upper layer's end counts
//!    as a boundary as well, so a non-top layer's footprint always reaches
//!    the layer capacity.
//! 3. **Tree generation**: split each lower tensor into sections at upper
//!    tensor boundaries (slivers under `smin` fold into the previous
//!    section) and record which upper tensors overlay it.

use crate::{SchedulerError, SchedulerResult};
use core_layout::{MemoryMap, MemoryMapBuilder, Region};
use core_status::{aligned_size, MemoryStatus};
use std::collections::HashMap;
use tracing::debug;

pub const DEFAULT_SMIN: usize = 16;

#[derive(Debug, Clone, Default)]
struct Node {
    lower_remaining: usize,
    upper_remaining: usize,
    lower_fragment_remaining: usize,
    upper_fragment_remaining: usize,
    posts: Vec<String>,
}

impl Node {
    fn new(size: usize) -> Self {
        Self {
            lower_remaining: size,
            upper_remaining: size,
            ..Self::default()
        }
    }
}

pub struct LayoutModel {
    builder: MemoryMapBuilder,
    nodes: HashMap<String, Node>,
    smin: usize,
    analyzed: bool,
}

impl LayoutModel {
    pub fn new(device_size: usize) -> Self {
        Self {
            builder: MemoryMapBuilder::new(device_size),
            nodes: HashMap::new(),
            smin: DEFAULT_SMIN,
            analyzed: false,
        }
    }

    /// Minimum useful section size; slivers below it become padding.
    pub fn with_smin(mut self, smin: usize) -> Self {
        self.smin = smin.max(1);
        self
    }

    fn region_size(&self, name: &str) -> usize {
        self.builder.regions.get(name).map_or(0, |r| r.size)
    }

    fn fragment_size(&self, name: &str) -> usize {
        self.builder.regions.get(name).map_or(0, |r| r.fragment_size)
    }

    fn set_fragment(&mut self, name: &str, size: usize) {
        if let Some(region) = self.builder.regions.get_mut(name) {
            region.fragment_size = size;
        }
        if let Some(node) = self.nodes.get_mut(name) {
            node.lower_fragment_remaining = size;
            node.upper_fragment_remaining = size;
        }
    }

    fn fill(&mut self, status: &MemoryStatus, align: usize) -> SchedulerResult<()> {
        let layer_size = self.builder.memory_size();
        for op_name in status.execution_order() {
            let op = status.snapshot_operator(&op_name)?;
            for tensor_name in op.tensors() {
                if self.nodes.contains_key(tensor_name) {
                    continue;
                }
                let tensor = status.snapshot_tensor(tensor_name)?;
                if tensor.is_persistent() || tensor.is_transient() {
                    continue;
                }
                let size = aligned_size(tensor.size(), align);
                if size > layer_size {
                    return Err(SchedulerError::Unplannable(tensor_name.clone()));
                }
                if self.builder.current_layer().requested_size + size > layer_size {
                    self.builder.create_layer();
                }
                self.builder.submit_region(Region::new(tensor_name.clone(), size));
                self.nodes.insert(tensor_name.clone(), Node::new(size));
            }
        }
        Ok(())
    }

    fn reset_pair_fragments(&mut self, lower: usize, upper: usize) {
        for layer_index in [lower, upper] {
            let names = self.builder.layers[layer_index].regions.clone();
            for name in names {
                let fragment = self.fragment_size(&name);
                if fragment != 0 {
                    self.builder.layers[layer_index].requested_size -= fragment;
                    self.set_fragment(&name, 0);
                }
            }
        }
    }

    /// Pairwise cumulative-offset walk between `lower` and `upper`,
    /// generating fragments on lower tensors.
    fn fragment_walk(&mut self, lower: usize, upper: usize) {
        let lowers = self.builder.layers[lower].regions.clone();
        let uppers = self.builder.layers[upper].regions.clone();

        let mut ql = 0;
        let mut qu = 0;
        let mut size_tl = 0usize;
        let mut size_tu = 0usize;
        while ql < lowers.len() && qu < uppers.len() {
            let tl_target = size_tl + self.region_size(&lowers[ql]);
            let tu_target =
                size_tu + self.region_size(&uppers[qu]) + self.fragment_size(&uppers[qu]);
            if tl_target == tu_target {
                size_tl = tl_target;
                size_tu = tu_target;
                ql += 1;
                qu += 1;
            } else if tl_target > tu_target {
                // Upper is behind; advance it.
                size_tu = tu_target;
                qu += 1;
            } else {
                // Lower is behind; pad only slivers too small to section.
                size_tl = tl_target;
                let delta = tu_target - size_tl;
                if delta < self.smin {
                    let old = self.fragment_size(&lowers[ql]);
                    self.set_fragment(&lowers[ql], delta);
                    let layer = &mut self.builder.layers[lower];
                    layer.requested_size = layer.requested_size + delta - old;
                    size_tl += delta;
                }
                ql += 1;
            }
        }

        // The upper layer's end boundary: pad the last lower tensor so the
        // layer footprint reaches capacity and the pair tiles evenly.
        let layer_size = self.builder.layers[lower].size;
        let requested = self.builder.layers[lower].requested_size;
        if requested < layer_size {
            if let Some(last) = self.builder.layers[lower].regions.last().cloned() {
                let gap = layer_size - requested;
                let fragment = self.fragment_size(&last) + gap;
                self.set_fragment(&last, fragment);
                self.builder.layers[lower].requested_size += gap;
            }
        }
    }

    fn generate_fragments(&mut self) {
        let mut moved = true;
        while moved {
            moved = false;
            let mut idx = self.builder.layers.len() as isize - 1;
            while idx >= 0 {
                let i = idx as usize;
                if !self.builder.layers[i].is_accommodatable() {
                    // Fragments pushed this layer over capacity: regenerate
                    // the pair after spilling tensors upward.
                    if i + 1 == self.builder.layers.len() {
                        self.builder.create_layer();
                    }
                    self.reset_pair_fragments(i, i + 1);
                    let mut insert_at = 0;
                    while !self.builder.layers[i].is_accommodatable() {
                        let Some(name) = self.builder.layers[i].regions.pop() else {
                            break;
                        };
                        let size = self.region_size(&name);
                        self.builder.layers[i].requested_size -= size;
                        self.builder.layers[i + 1].regions.insert(insert_at, name);
                        self.builder.layers[i + 1].requested_size += size;
                        insert_at += 1;
                    }
                    moved = true;
                    idx += 1;
                    continue;
                }
                if moved {
                    break;
                }
                if i == 0 {
                    break;
                }
                self.fragment_walk(i - 1, i);
                idx -= 1;
            }
        }
    }

    fn push_section(&mut self, name: &str, size: usize, smin: usize) {
        if size == 0 {
            return;
        }
        if let Some(region) = self.builder.regions.get_mut(name) {
            match region.sections.last_mut() {
                Some(last) if size < smin => *last += size,
                _ => region.sections.push(size),
            }
        }
    }

    fn generate_tree(&mut self) {
        let smin = self.smin;
        let layer_count = self.builder.layers.len();
        for lower in 0..layer_count.saturating_sub(1) {
            let upper = lower + 1;
            let lowers = self.builder.layers[lower].regions.clone();
            let uppers = self.builder.layers[upper].regions.clone();

            let mut ql = 0;
            let mut qu = 0;
            while ql < lowers.len() && qu < uppers.len() {
                let (mut nl_remaining, mut nl_fragment) = self
                    .nodes
                    .get(&lowers[ql])
                    .map_or((0, 0), |n| (n.upper_remaining, n.upper_fragment_remaining));
                let (mut nu_remaining, mut nu_fragment) = self
                    .nodes
                    .get(&uppers[qu])
                    .map_or((0, 0), |n| (n.lower_remaining, n.lower_fragment_remaining));

                let sectioned = nl_remaining.min(nu_remaining);
                self.push_section(&lowers[ql], sectioned, smin);
                nl_remaining -= sectioned;
                nu_remaining -= sectioned;

                // Overlaps involving fragment bytes yield no sections; they
                // only consume the remainders.
                if nl_remaining > 0 {
                    let overlap = nl_remaining.min(nu_fragment);
                    nl_remaining -= overlap;
                    nu_fragment -= overlap;
                } else if nu_remaining > 0 {
                    let overlap = nu_remaining.min(nl_fragment);
                    nu_remaining -= overlap;
                    nl_fragment -= overlap;
                } else {
                    let overlap = nl_fragment.min(nu_fragment);
                    nl_fragment -= overlap;
                    nu_fragment -= overlap;
                }

                if let Some(node) = self.nodes.get_mut(&lowers[ql]) {
                    node.upper_remaining = nl_remaining;
                    node.upper_fragment_remaining = nl_fragment;
                    node.posts.push(uppers[qu].clone());
                }
                if let Some(node) = self.nodes.get_mut(&uppers[qu]) {
                    node.lower_remaining = nu_remaining;
                    node.lower_fragment_remaining = nu_fragment;
                }
                if nl_remaining == 0 && nl_fragment == 0 {
                    ql += 1;
                }
                if nu_remaining == 0 && nu_fragment == 0 {
                    qu += 1;
                }
            }

            if qu == uppers.len() {
                while ql < lowers.len() {
                    let remaining = self
                        .nodes
                        .get(&lowers[ql])
                        .map_or(0, |n| n.upper_remaining);
                    self.push_section(&lowers[ql], remaining, smin);
                    if let Some(node) = self.nodes.get_mut(&lowers[ql]) {
                        node.upper_remaining = 0;
                    }
                    ql += 1;
                }
            }
        }

        // Top layer tensors are never overlaid: one section each.
        if let Some(top) = self.builder.layers.last() {
            for name in top.regions.clone() {
                let size = self.region_size(&name);
                if let Some(region) = self.builder.regions.get_mut(&name) {
                    region.sections.push(size);
                }
            }
        }
    }

    /// Run the full analysis. Idempotent.
    pub fn analyze(&mut self, status: &MemoryStatus, align: usize) -> SchedulerResult<()> {
        if self.analyzed {
            return Ok(());
        }
        self.fill(status, align)?;
        // A single layer needs neither fragments nor sections.
        if self.builder.layers.len() > 1 {
            self.generate_fragments();
            self.generate_tree();
        }
        debug!(
            target: "scheduler.layout",
            layers = self.builder.layers.len(),
            regions = self.builder.regions.len(),
            "layout analyzed"
        );
        self.analyzed = true;
        Ok(())
    }

    pub fn layer_count(&self) -> usize {
        self.builder.layers.len()
    }

    /// Upper tensors overlaying `tensor`, in overlay order.
    pub fn posts_of(&self, tensor: &str) -> Vec<String> {
        self.nodes.get(tensor).map_or_else(Vec::new, |n| n.posts.clone())
    }

    pub fn memory_map(&self) -> SchedulerResult<MemoryMap> {
        if !self.analyzed {
            return Err(SchedulerError::NotAnalyzed);
        }
        Ok(self.builder.clone().build())
    }
}
