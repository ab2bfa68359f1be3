//! Sampler descriptors shared by every pass

use ember_core::Result;
use std::collections::HashMap;
use wgpu::{AddressMode, FilterMode};

use crate::descriptor::{Descriptor, DescriptorView};
use crate::device::GraphicsDevice;

/// Sampler state written into a sampler-heap slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub mip_filter: FilterMode,
    pub address_mode: AddressMode,
    pub max_anisotropy: u16,
}

impl SamplerDesc {
    pub const fn new(filter: FilterMode, address_mode: AddressMode) -> Self {
        Self {
            min_filter: filter,
            mag_filter: filter,
            mip_filter: filter,
            address_mode,
            max_anisotropy: 1,
        }
    }
}

/// The fixed set of samplers materials pick from by index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplerKind {
    LinearWrap = 0,
    LinearClamp = 1,
    PointWrap = 2,
    PointClamp = 3,
    AnisotropicWrap = 4,
}

impl SamplerKind {
    pub const ALL: [SamplerKind; 5] = [
        SamplerKind::LinearWrap,
        SamplerKind::LinearClamp,
        SamplerKind::PointWrap,
        SamplerKind::PointClamp,
        SamplerKind::AnisotropicWrap,
    ];

    /// Position in the sampler table; the value materials store
    pub fn table_index(self) -> u32 {
        self as u32
    }

    pub fn desc(self) -> SamplerDesc {
        match self {
            SamplerKind::LinearWrap => SamplerDesc::new(FilterMode::Linear, AddressMode::Repeat),
            SamplerKind::LinearClamp => {
                SamplerDesc::new(FilterMode::Linear, AddressMode::ClampToEdge)
            }
            SamplerKind::PointWrap => SamplerDesc::new(FilterMode::Nearest, AddressMode::Repeat),
            SamplerKind::PointClamp => {
                SamplerDesc::new(FilterMode::Nearest, AddressMode::ClampToEdge)
            }
            SamplerKind::AnisotropicWrap => SamplerDesc {
                max_anisotropy: 16,
                ..SamplerDesc::new(FilterMode::Linear, AddressMode::Repeat)
            },
        }
    }
}

/// Owns one sampler-heap slot per [`SamplerKind`]
#[derive(Debug)]
pub struct SamplerManager {
    device: GraphicsDevice,
    descriptors: HashMap<SamplerKind, Descriptor>,
}

impl SamplerManager {
    pub fn new(device: &GraphicsDevice) -> Result<Self> {
        let mut descriptors = HashMap::with_capacity(SamplerKind::ALL.len());
        for kind in SamplerKind::ALL {
            let descriptor = device.allocate_descriptor(DescriptorView::Sampler(kind.desc()))?;
            descriptors.insert(kind, descriptor);
        }

        tracing::debug!("Created {} sampler descriptors", descriptors.len());
        Ok(Self {
            device: device.clone(),
            descriptors,
        })
    }

    pub fn descriptor(&self, kind: SamplerKind) -> Descriptor {
        self.descriptors[&kind]
    }

    /// Sampler table in [`SamplerKind::ALL`] order, as bound by passes
    pub fn table(&self) -> Vec<Descriptor> {
        SamplerKind::ALL
            .iter()
            .map(|kind| self.descriptor(*kind))
            .collect()
    }
}

impl Drop for SamplerManager {
    fn drop(&mut self) {
        for (_, descriptor) in self.descriptors.drain() {
            // Samplers are only referenced while frames are in flight, and the
            // render manager drains the queue before dropping this manager.
            if let Err(e) = self.device.free_descriptor(descriptor) {
                tracing::warn!("Failed to free sampler descriptor: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::DeviceConfig;

    #[test]
    fn test_sampler_table_order() {
        let device = GraphicsDevice::new(DeviceConfig::default()).unwrap();
        let samplers = SamplerManager::new(&device).unwrap();

        let table = samplers.table();
        for (i, kind) in SamplerKind::ALL.iter().enumerate() {
            assert_eq!(kind.table_index(), i as u32);
            assert_eq!(table[i], samplers.descriptor(*kind));
        }
        assert_eq!(SamplerKind::AnisotropicWrap.desc().max_anisotropy, 16);
    }

    #[test]
    fn test_samplers_free_on_drop() {
        let device = GraphicsDevice::new(DeviceConfig::default()).unwrap();
        {
            let _samplers = SamplerManager::new(&device).unwrap();
            assert_eq!(
                device
                    .descriptor_heap_usage(crate::descriptor::DescriptorHeapKind::Sampler)
                    .live,
                5
            );
        }
        assert_eq!(
            device
                .descriptor_heap_usage(crate::descriptor::DescriptorHeapKind::Sampler)
                .live,
            0
        );
    }
}
