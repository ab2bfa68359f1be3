//! Graphics device
//!
//! [`GraphicsDevice`] is the explicit context every renderer object is
//! created from. It owns the resource storage arena, the memory budget, the
//! descriptor heaps, device health and the pool of recycled command lists.
//! The device is cheap to clone; clones share the same state.

use ember_core::{DeviceConfig, EmberError, ErrorContext, Result};
use parking_lot::{Mutex, RwLock};
use slotmap::SlotMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::command::Command;
use crate::descriptor::{
    Descriptor, DescriptorAllocator, DescriptorHeapKind, DescriptorView, HeapUsage,
};
use crate::queue::Fence;
use crate::resource::{GpuResource, ResourceDimension, ResourceId, ResourceState};

/// Value a render target or depth buffer was last cleared to
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    Depth(f32),
}

/// Backing store of one resource on the GPU timeline
#[derive(Debug, Default)]
struct ResourceStorage {
    /// Buffers are zero-filled at creation; textures are filled on first upload
    data: Vec<u8>,
    last_clear: Option<ClearValue>,
    write_generation: u64,
}

/// Device health monitoring
#[derive(Debug)]
pub struct DeviceHealth {
    pub is_lost: AtomicBool,
    pub last_error: RwLock<Option<String>>,
    pub error_count: AtomicU64,
    pub last_successful_operation: RwLock<Instant>,
}

impl Default for DeviceHealth {
    fn default() -> Self {
        Self {
            is_lost: AtomicBool::new(false),
            last_error: RwLock::new(None),
            error_count: AtomicU64::new(0),
            last_successful_operation: RwLock::new(Instant::now()),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryBudget {
    used: AtomicU64,
    peak: AtomicU64,
    allocation_count: AtomicU64,
    failed_allocations: AtomicU64,
}

/// Memory accounting snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub used: u64,
    pub peak: u64,
    pub budget: u64,
    pub allocation_count: u64,
    pub failed_allocations: u64,
}

#[derive(Debug, Default)]
struct ExecutionCounters {
    command_lists: AtomicU64,
    commands: AtomicU64,
    draws: AtomicU64,
    barriers: AtomicU64,
    copies: AtomicU64,
    clears: AtomicU64,
}

/// Work the GPU timeline has executed so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub command_lists: u64,
    pub commands: u64,
    pub draws: u64,
    pub barriers: u64,
    pub copies: u64,
    pub clears: u64,
}

/// Command-list pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub available: usize,
}

/// Upper bound of idle command lists kept for reuse
const MAX_POOLED_COMMAND_LISTS: usize = 32;

/// State shared by all clones of a [`GraphicsDevice`] and by every resource
pub(crate) struct DeviceShared {
    config: DeviceConfig,
    storage: RwLock<SlotMap<ResourceId, ResourceStorage>>,
    memory: MemoryBudget,
    descriptors: Mutex<DescriptorAllocator>,
    health: DeviceHealth,
    counters: ExecutionCounters,
    command_lists: Mutex<Vec<Vec<Command>>>,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    fences: Mutex<Vec<Weak<Fence>>>,
}

impl DeviceShared {
    /// Called from `GpuResource::drop` once nothing references the resource
    pub(crate) fn release_resource(
        &self,
        id: ResourceId,
        size: u64,
        name: &str,
        views: &[Descriptor],
    ) {
        self.storage.write().remove(id);
        self.memory.used.fetch_sub(size, Ordering::Relaxed);

        if !views.is_empty() {
            let mut descriptors = self.descriptors.lock();
            for view in views {
                if let Err(e) = descriptors.free(*view) {
                    tracing::warn!("Failed to free view of '{}': {}", name, e);
                }
            }
        }

        ember_core::ember_trace!(
            ember_core::LogCategory::Resource,
            "Released '{}' ({} bytes)",
            name,
            size
        );
    }
}

/// Explicit graphics context; clones share one device
#[derive(Clone)]
pub struct GraphicsDevice {
    shared: Arc<DeviceShared>,
}

impl std::fmt::Debug for GraphicsDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsDevice")
            .field("memory", &self.memory_usage())
            .field("is_lost", &self.is_lost())
            .finish()
    }
}

impl GraphicsDevice {
    #[tracing::instrument(skip_all)]
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let heaps = &config.descriptor_heaps;
        if heaps.cbv_srv_uav == 0 || heaps.sampler == 0 || heaps.rtv == 0 || heaps.dsv == 0 {
            return Err(EmberError::configuration(
                "Descriptor heap capacities must be greater than zero",
            ));
        }
        if config.memory_budget_bytes == 0 {
            return Err(EmberError::configuration("Memory budget must be greater than zero"));
        }

        tracing::info!(
            "Graphics device created: budget {} MB, heaps {:?}, validation {}",
            config.memory_budget_bytes / (1024 * 1024),
            heaps,
            config.validation
        );

        Ok(Self {
            shared: Arc::new(DeviceShared {
                descriptors: Mutex::new(DescriptorAllocator::new(heaps)),
                config,
                storage: RwLock::new(SlotMap::with_key()),
                memory: MemoryBudget::default(),
                health: DeviceHealth::default(),
                counters: ExecutionCounters::default(),
                command_lists: Mutex::new(Vec::new()),
                pool_hits: AtomicU64::new(0),
                pool_misses: AtomicU64::new(0),
                fences: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    pub fn validation_enabled(&self) -> bool {
        self.shared.config.validation
    }

    /// Allocate a resource against the memory budget.
    ///
    /// Exceeding the budget is fatal and reported as [`EmberError::Allocation`].
    pub fn create_resource(
        &self,
        name: &str,
        dimension: ResourceDimension,
        initial_state: ResourceState,
    ) -> Result<Arc<GpuResource>> {
        self.check_alive()?;

        let size = dimension.size_in_bytes()?;
        if size == 0 {
            return Err(EmberError::contract(format!(
                "Resource '{}' has zero size",
                name
            )));
        }

        let budget = self.shared.config.memory_budget_bytes;
        let memory = &self.shared.memory;
        let reserved = memory
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= budget)
            });
        let used = match reserved {
            Ok(previous) => previous + size,
            Err(current) => {
                memory.failed_allocations.fetch_add(1, Ordering::Relaxed);
                return Err(EmberError::allocation(format!(
                    "Out of device memory allocating '{}'",
                    name
                ))
                .with_context(
                    ErrorContext::new("create_resource", "GraphicsDevice")
                        .with_metadata("requested", size)
                        .with_metadata("used", current)
                        .with_metadata("budget", budget),
                ));
            }
        };
        memory.peak.fetch_max(used, Ordering::Relaxed);
        memory.allocation_count.fetch_add(1, Ordering::Relaxed);

        let data = match dimension {
            ResourceDimension::Buffer { .. } => vec![0u8; size as usize],
            ResourceDimension::Texture2D { .. } => Vec::new(),
        };
        let id = self.shared.storage.write().insert(ResourceStorage {
            data,
            ..ResourceStorage::default()
        });

        ember_core::ember_debug!(
            ember_core::LogCategory::Resource,
            "Created '{}' ({} bytes, {:?})",
            name,
            size,
            initial_state
        );

        Ok(Arc::new(GpuResource::new(
            id,
            name.to_string(),
            dimension,
            size,
            initial_state,
            self.shared.clone(),
        )))
    }

    /// Create a view descriptor owned by `resource`; freed when it drops
    pub fn create_view(&self, resource: &GpuResource, view: DescriptorView) -> Result<Descriptor> {
        let descriptor = self.allocate_descriptor(view)?;
        resource.attach_view(descriptor);
        Ok(descriptor)
    }

    pub fn allocate_descriptor(&self, view: DescriptorView) -> Result<Descriptor> {
        self.shared.descriptors.lock().allocate(view)
    }

    /// Return a descriptor no pending GPU work refers to
    pub fn free_descriptor(&self, descriptor: Descriptor) -> Result<()> {
        self.shared.descriptors.lock().free(descriptor)
    }

    /// Free a descriptor once the GPU has passed `fence_value`
    pub fn retire_descriptor(&self, descriptor: Descriptor, fence_value: u64) -> Result<()> {
        self.shared.descriptors.lock().retire(descriptor, fence_value)
    }

    /// Recycle retired descriptors whose fence has completed
    pub fn reclaim_descriptors(&self, completed_fence: u64) -> usize {
        let reclaimed = self.shared.descriptors.lock().reclaim(completed_fence);
        if reclaimed > 0 {
            ember_core::ember_debug!(
                ember_core::LogCategory::Descriptor,
                "Reclaimed {} descriptors at fence {}",
                reclaimed,
                completed_fence
            );
        }
        reclaimed
    }

    pub fn descriptor_view(&self, descriptor: Descriptor) -> Option<DescriptorView> {
        self.shared.descriptors.lock().view(descriptor).cloned()
    }

    pub fn descriptor_heap_usage(&self, kind: DescriptorHeapKind) -> HeapUsage {
        self.shared.descriptors.lock().heap(kind).usage()
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let memory = &self.shared.memory;
        MemoryUsage {
            used: memory.used.load(Ordering::Relaxed),
            peak: memory.peak.load(Ordering::Relaxed),
            budget: self.shared.config.memory_budget_bytes,
            allocation_count: memory.allocation_count.load(Ordering::Relaxed),
            failed_allocations: memory.failed_allocations.load(Ordering::Relaxed),
        }
    }

    pub fn stats(&self) -> ExecutionStats {
        let c = &self.shared.counters;
        ExecutionStats {
            command_lists: c.command_lists.load(Ordering::Relaxed),
            commands: c.commands.load(Ordering::Relaxed),
            draws: c.draws.load(Ordering::Relaxed),
            barriers: c.barriers.load(Ordering::Relaxed),
            copies: c.copies.load(Ordering::Relaxed),
            clears: c.clears.load(Ordering::Relaxed),
        }
    }

    pub fn live_resource_count(&self) -> usize {
        self.shared.storage.read().len()
    }

    /// Snapshot of the bytes the GPU timeline holds for `resource`
    pub fn read_resource(&self, resource: &GpuResource) -> Vec<u8> {
        self.shared
            .storage
            .read()
            .get(resource.id())
            .map(|storage| storage.data.clone())
            .unwrap_or_default()
    }

    /// Number of draws that have written to `resource` as a bound target
    pub fn write_generation(&self, resource: &GpuResource) -> u64 {
        self.shared
            .storage
            .read()
            .get(resource.id())
            .map_or(0, |storage| storage.write_generation)
    }

    pub fn last_clear(&self, resource: &GpuResource) -> Option<ClearValue> {
        self.shared
            .storage
            .read()
            .get(resource.id())
            .and_then(|storage| storage.last_clear)
    }

    /// CPU write into a buffer's storage (upload heap semantics)
    pub(crate) fn write_buffer(&self, resource: &GpuResource, offset: u64, data: &[u8]) -> Result<()> {
        let mut storage = self.shared.storage.write();
        let entry = storage.get_mut(resource.id()).ok_or_else(|| {
            EmberError::contract(format!("Resource '{}' has no storage", resource.name()))
        })?;

        let start = offset as usize;
        let end = start + data.len();
        if end > entry.data.len() {
            return Err(EmberError::contract(format!(
                "Write of {} bytes at offset {} exceeds '{}' ({} bytes)",
                data.len(),
                offset,
                resource.name(),
                entry.data.len()
            )));
        }
        entry.data[start..end].copy_from_slice(data);
        Ok(())
    }

    pub fn is_lost(&self) -> bool {
        self.shared.health.is_lost.load(Ordering::Acquire)
    }

    pub fn health(&self) -> &DeviceHealth {
        &self.shared.health
    }

    /// Mark the device removed and wake every waiter on its fences
    pub fn mark_removed(&self, reason: &str) {
        if self.shared.health.is_lost.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.shared.health.last_error.write() = Some(reason.to_string());
        self.shared.health.error_count.fetch_add(1, Ordering::Relaxed);
        tracing::error!("Device removed: {}", reason);

        let fences = std::mem::take(&mut *self.shared.fences.lock());
        for fence in fences.iter().filter_map(Weak::upgrade) {
            fence.poison();
        }
    }

    /// Fail with [`EmberError::DeviceRemoved`] once the device is lost
    pub fn check_alive(&self) -> Result<()> {
        if self.is_lost() {
            let reason = self
                .shared
                .health
                .last_error
                .read()
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            return Err(EmberError::device_removed(reason));
        }
        Ok(())
    }

    pub fn command_list_pool_stats(&self) -> PoolStats {
        PoolStats {
            hits: self.shared.pool_hits.load(Ordering::Relaxed),
            misses: self.shared.pool_misses.load(Ordering::Relaxed),
            available: self.shared.command_lists.lock().len(),
        }
    }

    pub(crate) fn register_fence(&self, fence: &Arc<Fence>) {
        let mut fences = self.shared.fences.lock();
        fences.retain(|f| f.strong_count() > 0);
        fences.push(Arc::downgrade(fence));
    }

    pub(crate) fn acquire_command_list(&self) -> Vec<Command> {
        match self.shared.command_lists.lock().pop() {
            Some(list) => {
                self.shared.pool_hits.fetch_add(1, Ordering::Relaxed);
                list
            }
            None => {
                self.shared.pool_misses.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(256)
            }
        }
    }

    pub(crate) fn recycle_command_list(&self, mut list: Vec<Command>) {
        // Clearing drops the resource references the list kept alive
        list.clear();
        let mut pool = self.shared.command_lists.lock();
        if pool.len() < MAX_POOLED_COMMAND_LISTS {
            pool.push(list);
        }
    }

    // GPU timeline side

    pub(crate) fn count_command_list(&self, commands: usize) {
        let c = &self.shared.counters;
        c.command_lists.fetch_add(1, Ordering::Relaxed);
        c.commands.fetch_add(commands as u64, Ordering::Relaxed);
        *self.shared.health.last_successful_operation.write() = Instant::now();
    }

    pub(crate) fn count_barriers(&self, count: usize) {
        self.shared
            .counters
            .barriers
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn count_draw(&self, targets: &[&GpuResource]) {
        self.shared.counters.draws.fetch_add(1, Ordering::Relaxed);
        let mut storage = self.shared.storage.write();
        for target in targets {
            if let Some(entry) = storage.get_mut(target.id()) {
                entry.write_generation += 1;
            }
        }
    }

    pub(crate) fn apply_clear(&self, resource: &GpuResource, value: ClearValue) {
        self.shared.counters.clears.fetch_add(1, Ordering::Relaxed);
        if let Some(entry) = self.shared.storage.write().get_mut(resource.id()) {
            entry.last_clear = Some(value);
        }
    }

    pub(crate) fn apply_buffer_copy(
        &self,
        dst: &GpuResource,
        dst_offset: u64,
        src: &GpuResource,
        src_offset: u64,
        size: u64,
    ) {
        self.shared.counters.copies.fetch_add(1, Ordering::Relaxed);
        let mut storage = self.shared.storage.write();
        let bytes = match storage.get(src.id()) {
            Some(entry) => {
                let start = src_offset as usize;
                entry.data[start..start + size as usize].to_vec()
            }
            None => return,
        };
        if let Some(entry) = storage.get_mut(dst.id()) {
            let start = dst_offset as usize;
            entry.data[start..start + bytes.len()].copy_from_slice(&bytes);
        }
    }

    pub(crate) fn apply_texture_upload(&self, dst: &GpuResource, src: &GpuResource, size: u64) {
        self.shared.counters.copies.fetch_add(1, Ordering::Relaxed);
        let mut storage = self.shared.storage.write();
        let bytes = match storage.get(src.id()) {
            Some(entry) => entry.data[..size as usize].to_vec(),
            None => return,
        };
        if let Some(entry) = storage.get_mut(dst.id()) {
            entry.data = bytes;
            entry.write_generation += 1;
        }
    }
}
