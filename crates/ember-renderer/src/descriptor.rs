//! Descriptor heaps
//!
//! Each heap kind has a fixed capacity chosen at device creation. Slots are
//! handed out from a free list; a slot that in-flight work may still read is
//! retired with the fence value of that work and only returns to the free
//! list once the fence has completed.

use ember_core::{EmberError, ErrorContext, Result};
use std::fmt;

use crate::resource::ResourceId;
use crate::sampler::SamplerDesc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    CbvSrvUav,
    Sampler,
    Rtv,
    Dsv,
}

impl DescriptorHeapKind {
    pub const ALL: [DescriptorHeapKind; 4] = [
        DescriptorHeapKind::CbvSrvUav,
        DescriptorHeapKind::Sampler,
        DescriptorHeapKind::Rtv,
        DescriptorHeapKind::Dsv,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DescriptorHeapKind::CbvSrvUav => "cbv_srv_uav",
            DescriptorHeapKind::Sampler => "sampler",
            DescriptorHeapKind::Rtv => "rtv",
            DescriptorHeapKind::Dsv => "dsv",
        }
    }

    fn slot(self) -> usize {
        match self {
            DescriptorHeapKind::CbvSrvUav => 0,
            DescriptorHeapKind::Sampler => 1,
            DescriptorHeapKind::Rtv => 2,
            DescriptorHeapKind::Dsv => 3,
        }
    }
}

impl fmt::Display for DescriptorHeapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to one slot of a descriptor heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub kind: DescriptorHeapKind,
    pub index: u32,
}

/// What a live descriptor slot describes
#[derive(Debug, Clone, PartialEq)]
pub enum DescriptorView {
    ConstantBuffer { resource: ResourceId, offset: u64, size: u64 },
    ShaderResource { resource: ResourceId },
    RenderTarget { resource: ResourceId },
    DepthStencil { resource: ResourceId },
    Sampler(SamplerDesc),
    /// Slot reserved by a client that writes it itself (overlay font atlas)
    External { label: String },
}

impl DescriptorView {
    /// Heap kind a view of this type must live in
    pub fn heap_kind(&self) -> DescriptorHeapKind {
        match self {
            DescriptorView::ConstantBuffer { .. }
            | DescriptorView::ShaderResource { .. }
            | DescriptorView::External { .. } => DescriptorHeapKind::CbvSrvUav,
            DescriptorView::Sampler(_) => DescriptorHeapKind::Sampler,
            DescriptorView::RenderTarget { .. } => DescriptorHeapKind::Rtv,
            DescriptorView::DepthStencil { .. } => DescriptorHeapKind::Dsv,
        }
    }

    /// Resource the view points at, if any
    pub fn resource(&self) -> Option<ResourceId> {
        match *self {
            DescriptorView::ConstantBuffer { resource, .. }
            | DescriptorView::ShaderResource { resource }
            | DescriptorView::RenderTarget { resource }
            | DescriptorView::DepthStencil { resource } => Some(resource),
            DescriptorView::Sampler(_) | DescriptorView::External { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Free,
    Live(DescriptorView),
    /// Waiting for the GPU to pass this fence value
    Retired(u64),
}

/// Usage counters of one heap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapUsage {
    pub capacity: u32,
    pub live: u32,
    pub retired: u32,
}

/// Fixed-capacity heap of one descriptor kind
#[derive(Debug)]
pub struct DescriptorHeap {
    kind: DescriptorHeapKind,
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    retired: Vec<u32>,
}

impl DescriptorHeap {
    pub fn new(kind: DescriptorHeapKind, capacity: u32) -> Self {
        Self {
            kind,
            slots: vec![Slot::Free; capacity as usize],
            // Popped from the back, so index 0 is handed out first
            free_list: (0..capacity).rev().collect(),
            retired: Vec::new(),
        }
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn live_count(&self) -> u32 {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count() as u32
    }

    pub fn usage(&self) -> HeapUsage {
        HeapUsage {
            capacity: self.capacity(),
            live: self.live_count(),
            retired: self.retired.len() as u32,
        }
    }

    /// Take a free slot and write `view` into it
    pub fn allocate(&mut self, view: DescriptorView) -> Result<Descriptor> {
        if view.heap_kind() != self.kind {
            return Err(EmberError::contract(format!(
                "Cannot place a {} view in the {} heap",
                view.heap_kind(),
                self.kind
            )));
        }

        let index = self.free_list.pop().ok_or_else(|| {
            EmberError::capacity(format!(
                "Descriptor heap {} is full ({} slots)",
                self.kind,
                self.capacity()
            ))
            .with_context(
                ErrorContext::new("allocate", "DescriptorHeap")
                    .with_metadata("kind", self.kind)
                    .with_metadata("retired", self.retired.len()),
            )
        })?;

        self.slots[index as usize] = Slot::Live(view);
        Ok(Descriptor {
            kind: self.kind,
            index,
        })
    }

    fn check_live(&self, descriptor: Descriptor) -> Result<()> {
        if descriptor.kind != self.kind {
            return Err(EmberError::contract(format!(
                "Descriptor of kind {} released into the {} heap",
                descriptor.kind, self.kind
            )));
        }
        match self.slots.get(descriptor.index as usize) {
            Some(Slot::Live(_)) => Ok(()),
            Some(_) => Err(EmberError::contract(format!(
                "Descriptor {}[{}] is not live",
                self.kind, descriptor.index
            ))),
            None => Err(EmberError::contract(format!(
                "Descriptor index {} out of range for the {} heap",
                descriptor.index, self.kind
            ))),
        }
    }

    /// Return a slot no pending GPU work refers to
    pub fn free(&mut self, descriptor: Descriptor) -> Result<()> {
        self.check_live(descriptor)?;
        self.slots[descriptor.index as usize] = Slot::Free;
        self.free_list.push(descriptor.index);
        Ok(())
    }

    /// Release a slot once the GPU reaches `fence_value`
    pub fn retire(&mut self, descriptor: Descriptor, fence_value: u64) -> Result<()> {
        self.check_live(descriptor)?;
        self.slots[descriptor.index as usize] = Slot::Retired(fence_value);
        self.retired.push(descriptor.index);
        Ok(())
    }

    /// Move retired slots whose fence has completed back to the free list.
    /// Returns how many slots were reclaimed.
    pub fn reclaim(&mut self, completed_fence: u64) -> usize {
        let mut reclaimed = 0;
        let slots = &mut self.slots;
        let free_list = &mut self.free_list;

        self.retired.retain(|&index| {
            let slot = &mut slots[index as usize];
            match *slot {
                Slot::Retired(fence) if fence <= completed_fence => {
                    *slot = Slot::Free;
                    free_list.push(index);
                    reclaimed += 1;
                    false
                }
                _ => true,
            }
        });

        reclaimed
    }

    /// View currently stored at a live slot
    pub fn view(&self, descriptor: Descriptor) -> Option<&DescriptorView> {
        if descriptor.kind != self.kind {
            return None;
        }
        match self.slots.get(descriptor.index as usize) {
            Some(Slot::Live(view)) => Some(view),
            _ => None,
        }
    }
}

/// The four heaps of a device; serialized by the device behind one lock
#[derive(Debug)]
pub struct DescriptorAllocator {
    heaps: [DescriptorHeap; 4],
}

impl DescriptorAllocator {
    pub fn new(sizes: &ember_core::DescriptorHeapSizes) -> Self {
        Self {
            heaps: [
                DescriptorHeap::new(DescriptorHeapKind::CbvSrvUav, sizes.cbv_srv_uav),
                DescriptorHeap::new(DescriptorHeapKind::Sampler, sizes.sampler),
                DescriptorHeap::new(DescriptorHeapKind::Rtv, sizes.rtv),
                DescriptorHeap::new(DescriptorHeapKind::Dsv, sizes.dsv),
            ],
        }
    }

    pub fn heap(&self, kind: DescriptorHeapKind) -> &DescriptorHeap {
        &self.heaps[kind.slot()]
    }

    pub fn heap_mut(&mut self, kind: DescriptorHeapKind) -> &mut DescriptorHeap {
        &mut self.heaps[kind.slot()]
    }

    pub fn allocate(&mut self, view: DescriptorView) -> Result<Descriptor> {
        self.heap_mut(view.heap_kind()).allocate(view)
    }

    pub fn free(&mut self, descriptor: Descriptor) -> Result<()> {
        self.heap_mut(descriptor.kind).free(descriptor)
    }

    pub fn retire(&mut self, descriptor: Descriptor, fence_value: u64) -> Result<()> {
        self.heap_mut(descriptor.kind).retire(descriptor, fence_value)
    }

    pub fn reclaim(&mut self, completed_fence: u64) -> usize {
        self.heaps
            .iter_mut()
            .map(|heap| heap.reclaim(completed_fence))
            .sum()
    }

    pub fn view(&self, descriptor: Descriptor) -> Option<&DescriptorView> {
        self.heap(descriptor.kind).view(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use slotmap::KeyData;

    fn srv(n: u64) -> DescriptorView {
        DescriptorView::ShaderResource {
            resource: ResourceId::from(KeyData::from_ffi(n)),
        }
    }

    #[test]
    fn test_capacity_four_heap() {
        let mut heap = DescriptorHeap::new(DescriptorHeapKind::CbvSrvUav, 4);

        let a = heap.allocate(srv(1)).unwrap();
        let b = heap.allocate(srv(2)).unwrap();
        let c = heap.allocate(srv(3)).unwrap();

        let mut indices = vec![a.index, b.index, c.index];
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 3);
        assert!(indices.iter().all(|&i| i < 4));

        heap.allocate(srv(4)).unwrap();
        let err = heap.allocate(srv(5)).unwrap_err();
        assert!(matches!(err, EmberError::CapacityExceeded { .. }));
    }

    #[test]
    fn test_free_makes_slot_reusable() {
        let mut heap = DescriptorHeap::new(DescriptorHeapKind::Rtv, 1);
        let rtv = DescriptorView::RenderTarget {
            resource: ResourceId::default(),
        };

        let first = heap.allocate(rtv.clone()).unwrap();
        assert_eq!(first.index, 0);
        heap.free(first).unwrap();

        let second = heap.allocate(rtv).unwrap();
        assert_eq!(second.index, 0);

        // Double free is a programming error
        heap.free(second).unwrap();
        assert!(heap.free(second).unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_retired_slots_wait_for_fence() {
        let mut heap = DescriptorHeap::new(DescriptorHeapKind::CbvSrvUav, 2);
        let a = heap.allocate(srv(1)).unwrap();
        heap.allocate(srv(2)).unwrap();

        heap.retire(a, 5).unwrap();
        assert_eq!(
            heap.usage(),
            HeapUsage {
                capacity: 2,
                live: 1,
                retired: 1
            }
        );
        assert!(heap.allocate(srv(3)).is_err());

        assert_eq!(heap.reclaim(4), 0);
        assert_eq!(heap.reclaim(5), 1);
        assert_eq!(heap.allocate(srv(3)).unwrap().index, a.index);
    }

    #[test]
    fn test_each_retired_slot_keeps_its_own_fence() {
        let mut heap = DescriptorHeap::new(DescriptorHeapKind::CbvSrvUav, 2);
        let early = heap.allocate(srv(1)).unwrap();
        let late = heap.allocate(srv(2)).unwrap();
        heap.retire(late, 7).unwrap();
        heap.retire(early, 3).unwrap();

        assert_eq!(heap.reclaim(5), 1);
        assert_eq!(heap.usage().retired, 1);
        assert_eq!(heap.allocate(srv(3)).unwrap().index, early.index);
        assert!(heap.allocate(srv(4)).is_err());

        assert_eq!(heap.reclaim(7), 1);
        assert_eq!(heap.allocate(srv(4)).unwrap().index, late.index);
    }

    #[test]
    fn test_wrong_heap_kind_is_rejected() {
        let mut heap = DescriptorHeap::new(DescriptorHeapKind::Sampler, 4);
        assert!(heap.allocate(srv(1)).unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_allocator_routes_by_kind() {
        let mut allocator = DescriptorAllocator::new(&ember_core::DescriptorHeapSizes {
            cbv_srv_uav: 8,
            sampler: 2,
            rtv: 2,
            dsv: 1,
        });

        let dsv = allocator
            .allocate(DescriptorView::DepthStencil {
                resource: ResourceId::default(),
            })
            .unwrap();
        assert_eq!(dsv.kind, DescriptorHeapKind::Dsv);
        assert!(allocator.view(dsv).is_some());
        assert_eq!(allocator.heap(DescriptorHeapKind::Dsv).live_count(), 1);
        assert_eq!(allocator.heap(DescriptorHeapKind::CbvSrvUav).live_count(), 0);
    }
}
