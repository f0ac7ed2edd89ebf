//! Placement-aware model loading
//!
//! Model runtimes materialize weights themselves; this crate only decides
//! where each layer goes. [`ModelLoader`] and [`AdapterLoader`] are the seams a
//! runtime binding implements to receive those decisions.

use std::fmt;

use crate::allocator::LayerAllocator;
use crate::device::DeviceInventory;
use crate::error::Result;
use crate::mapping::DeviceMapping;

/// Loads pretrained weights according to a placement map
pub trait ModelLoader {
    type Model;

    fn load_pretrained(&self, model_id: &str, placement: &DeviceMapping) -> Result<Self::Model>;
}

/// Wraps an already-placed base model with a parameter-efficient adapter
pub trait AdapterLoader<M> {
    type Adapted;

    /// `placement` is the base model's map rewritten under the adapter prefix
    fn load_adapter(&self, base: M, adapter_id: &str, placement: &DeviceMapping) -> Result<Self::Adapted>;
}

/// A loaded model together with the placement it was loaded with
#[derive(Debug)]
pub struct PlacedModel<M> {
    model_id: String,
    model: M,
    mapping: DeviceMapping,
}

impl<M> PlacedModel<M> {
    /// Allocate layers for `model_id` and load it
    pub fn load<I, L>(allocator: &LayerAllocator<I>, loader: &L, model_id: &str) -> Result<Self>
    where
        I: DeviceInventory,
        L: ModelLoader<Model = M>,
    {
        let mapping = allocator.allocate(model_id)?;
        tracing::info!(model = model_id, entries = mapping.len(), "loading model with placement");
        let model = loader.load_pretrained(model_id, &mapping)?;
        Ok(Self {
            model_id: model_id.to_string(),
            model,
            mapping,
        })
    }

    /// Layer an adapter over the loaded model
    ///
    /// The adapter's placement is derived from this model's existing mapping
    /// rather than from a fresh memory sample, so adapter and base agree.
    pub fn with_adapter<A>(self, loader: &A, adapter_id: &str, prefix: &str) -> Result<PlacedModel<A::Adapted>>
    where
        A: AdapterLoader<M>,
    {
        let mapping = self.mapping.to_adapter_mapping(prefix);
        tracing::info!(
            model = %self.model_id,
            adapter = adapter_id,
            prefix,
            "attaching adapter"
        );
        let model = loader.load_adapter(self.model, adapter_id, &mapping)?;
        Ok(PlacedModel {
            model_id: self.model_id,
            model,
            mapping,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn mapping(&self) -> &DeviceMapping {
        &self.mapping
    }

    pub fn into_inner(self) -> M {
        self.model
    }
}

/// Instruction-following prompt: the instruction, a blank line, then the input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionPrompt {
    pub instruction: String,
    pub input: String,
}

impl InstructionPrompt {
    pub fn new(instruction: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            input: input.into(),
        }
    }
}

impl fmt::Display for InstructionPrompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\nInput:\n{}", self.instruction, self.input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AllocatorConfig, TopologyRegistry, DEFAULT_ADAPTER_PREFIX};
    use crate::device::{DeviceId, RuntimeInventory, SimulatedRuntime};
    use crate::error::LayerMapError;
    use crate::topology::ModelTopology;

    /// Records the placement it was given
    struct RecordingLoader;

    #[derive(Debug)]
    struct FakeModel {
        placement: DeviceMapping,
    }

    impl ModelLoader for RecordingLoader {
        type Model = FakeModel;

        fn load_pretrained(&self, _model_id: &str, placement: &DeviceMapping) -> Result<FakeModel> {
            Ok(FakeModel {
                placement: placement.clone(),
            })
        }
    }

    struct RecordingAdapter;

    #[derive(Debug)]
    struct FakeAdapted {
        base: FakeModel,
        adapter_id: String,
        placement: DeviceMapping,
    }

    impl AdapterLoader<FakeModel> for RecordingAdapter {
        type Adapted = FakeAdapted;

        fn load_adapter(&self, base: FakeModel, adapter_id: &str, placement: &DeviceMapping) -> Result<FakeAdapted> {
            Ok(FakeAdapted {
                base,
                adapter_id: adapter_id.to_string(),
                placement: placement.clone(),
            })
        }
    }

    struct FailingLoader;

    impl ModelLoader for FailingLoader {
        type Model = ();

        fn load_pretrained(&self, model_id: &str, _placement: &DeviceMapping) -> Result<()> {
            Err(LayerMapError::collaborator("model load", format!("{} not found", model_id)))
        }
    }

    fn allocator() -> LayerAllocator<RuntimeInventory<SimulatedRuntime>> {
        let mut registry = TopologyRegistry::new();
        registry.insert(ModelTopology::new("llama-7b", "model", "layers", 8, 8).unwrap());
        LayerAllocator::new(
            registry,
            RuntimeInventory::new(SimulatedRuntime::new(vec![100, 300])),
            AllocatorConfig::default(),
        )
    }

    #[test]
    fn test_load_passes_mapping() {
        let allocator = allocator();
        let placed = PlacedModel::load(&allocator, &RecordingLoader, "llama-7b").unwrap();

        assert_eq!(placed.model_id(), "llama-7b");
        assert_eq!(placed.mapping().len(), 8);
        assert_eq!(&placed.model().placement, placed.mapping());
        assert_eq!(placed.mapping().get("model.layers.7"), Some(DeviceId::new(1)));
    }

    #[test]
    fn test_with_adapter_uses_prefixed_mapping() {
        let allocator = allocator();
        let placed = PlacedModel::load(&allocator, &RecordingLoader, "llama-7b").unwrap();
        let base_mapping = placed.mapping().clone();

        let adapted = placed
            .with_adapter(&RecordingAdapter, "alpaca-lora-7b", DEFAULT_ADAPTER_PREFIX)
            .unwrap();

        assert_eq!(adapted.mapping().len(), 9);
        assert_eq!(adapted.mapping(), &base_mapping.to_adapter_mapping("base_model.model"));
        let inner = adapted.into_inner();
        assert_eq!(inner.adapter_id, "alpaca-lora-7b");
        assert_eq!(inner.base.placement, base_mapping);
        assert_eq!(inner.placement.get(""), Some(DeviceId::PRIMARY));
    }

    #[test]
    fn test_loader_failure_propagates() {
        let allocator = allocator();
        let err = PlacedModel::load(&allocator, &FailingLoader, "llama-7b").unwrap_err();
        assert_eq!(err.to_string(), "model load failed: llama-7b not found");
    }

    #[test]
    fn test_instruction_prompt() {
        let prompt = InstructionPrompt::new("Translate to French.", "Good morning");
        assert_eq!(prompt.to_string(), "Translate to French.\n\nInput:\nGood morning");
    }
}
