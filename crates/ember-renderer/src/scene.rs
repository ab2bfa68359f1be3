//! Model instances fed to the geometry pass

use glam::Mat4;
use slotmap::SlotMap;
use std::sync::Arc;

use crate::model::{Mesh, Model};

slotmap::new_key_type! {
    pub struct InstanceKey;
}

#[derive(Debug, Clone)]
pub struct ModelInstance {
    pub model: Arc<Model>,
    pub world: Mat4,
    pub visible: bool,
}

impl ModelInstance {
    pub fn new(model: Arc<Model>, world: Mat4) -> Self {
        Self {
            model,
            world,
            visible: true,
        }
    }
}

/// One mesh to draw with its world transform
#[derive(Debug, Clone)]
pub struct DrawItem {
    pub model: Arc<Model>,
    pub mesh_index: usize,
    pub world: Mat4,
}

impl DrawItem {
    /// `None` when `mesh_index` is past the model's meshes
    pub fn mesh(&self) -> Option<&Mesh> {
        self.model.meshes().get(self.mesh_index)
    }
}

/// Registry of the instances the renderer draws each frame
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: SlotMap<InstanceKey, ModelInstance>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, instance: ModelInstance) -> InstanceKey {
        self.instances.insert(instance)
    }

    pub fn remove(&mut self, key: InstanceKey) -> Option<ModelInstance> {
        self.instances.remove(key)
    }

    pub fn get(&self, key: InstanceKey) -> Option<&ModelInstance> {
        self.instances.get(key)
    }

    pub fn get_mut(&mut self, key: InstanceKey) -> Option<&mut ModelInstance> {
        self.instances.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Flatten visible instances into per-mesh draw items
    pub fn draw_items(&self) -> Vec<DrawItem> {
        self.instances
            .values()
            .filter(|instance| instance.visible)
            .flat_map(|instance| {
                (0..instance.model.meshes().len()).map(move |mesh_index| DrawItem {
                    model: instance.model.clone(),
                    mesh_index,
                    world: instance.world,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandContext;
    use crate::device::GraphicsDevice;
    use crate::model::quad_model_data;
    use crate::queue::{CommandQueue, QueueKind};
    use crate::texture::DefaultTextures;
    use ember_core::DeviceConfig;

    #[test]
    fn test_draw_items_skip_hidden_instances() {
        let device = GraphicsDevice::new(DeviceConfig::default()).unwrap();
        let mut queue = CommandQueue::new(&device, QueueKind::Direct).unwrap();
        let mut ctx = CommandContext::new(&device, "defaults");
        let defaults = DefaultTextures::create(&mut ctx).unwrap();
        ctx.close().unwrap();
        queue.execute(&mut ctx).unwrap();
        let model = Model::create(&device, &mut queue, &defaults, &quad_model_data("quad")).unwrap();

        let mut registry = InstanceRegistry::new();
        let shown = registry.insert(ModelInstance::new(model.clone(), Mat4::IDENTITY));
        let hidden = registry.insert(ModelInstance::new(model, Mat4::from_translation(glam::Vec3::X)));
        registry.get_mut(hidden).unwrap().visible = false;

        let items = registry.draw_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].world, Mat4::IDENTITY);
        assert_eq!(items[0].mesh().unwrap().index_count(), 6);

        registry.remove(shown);
        assert!(registry.draw_items().is_empty());
        assert_eq!(registry.len(), 1);
    }
}
