use chrono::{DateTime, Utc};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use crate::flow::TypedFlowType;
use crate::{steps, Flow, FlowError, FlowId, FlowInstance, FlowType};

/// Collects flow types at startup; see [`FlowRegistry`].
#[derive(Default)]
pub struct FlowRegistryBuilder {
    by_name: HashMap<String, Arc<dyn FlowType>>,
    by_type: HashMap<TypeId, String>,
}

impl FlowRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers flow type `F` under `name`, or under its Rust type name.
    pub fn add<F: Flow>(&mut self, name: Option<&str>) -> Result<&mut Self, FlowError> {
        let name = match name {
            Some(name) => name.to_string(),
            None => short_type_name::<F>(),
        };
        if name.is_empty() || name.contains('/') {
            return Err(FlowError::Internal(format!("Invalid flow type name: '{}'", name)));
        }
        if self.by_name.contains_key(&name) {
            return Err(FlowError::KeyExists(name));
        }
        if let Some(existing) = self.by_type.get(&TypeId::of::<F>()) {
            return Err(FlowError::KeyExists(format!(
                "{} (already registered as '{}')",
                std::any::type_name::<F>(),
                existing
            )));
        }

        let flow_type = TypedFlowType::<F>::build(&name)?;
        tracing::debug!("Registering flow type: {}", name);
        self.by_type.insert(TypeId::of::<F>(), name.clone());
        self.by_name.insert(name, Arc::new(flow_type));
        Ok(self)
    }

    pub fn build(self) -> FlowRegistry {
        FlowRegistry {
            by_name: self.by_name,
            by_type: self.by_type,
        }
    }
}

/// Immutable mapping between flow type names and their implementations.
/// Built once and shared by reference; lookups need no synchronization.
pub struct FlowRegistry {
    by_name: HashMap<String, Arc<dyn FlowType>>,
    by_type: HashMap<TypeId, String>,
}

impl FlowRegistry {
    pub fn builder() -> FlowRegistryBuilder {
        FlowRegistryBuilder::new()
    }

    pub fn new_id<F: Flow>(&self, arguments: impl Into<String>) -> Result<FlowId, FlowError> {
        Ok(FlowId::new(self.name_of::<F>()?, arguments))
    }

    pub fn new_id_for(&self, name: &str, arguments: impl Into<String>) -> Result<FlowId, FlowError> {
        self.flow_type(name)?;
        Ok(FlowId::new(name, arguments))
    }

    pub fn name_of<F: Flow>(&self) -> Result<&str, FlowError> {
        self.by_type
            .get(&TypeId::of::<F>())
            .map(String::as_str)
            .ok_or_else(|| FlowError::UnknownFlowType(std::any::type_name::<F>().to_string()))
    }

    pub fn flow_type(&self, name: &str) -> Result<&Arc<dyn FlowType>, FlowError> {
        self.by_name
            .get(name)
            .ok_or_else(|| FlowError::UnknownFlowType(name.to_string()))
    }

    /// A brand-new, never started flow for `id`.
    pub fn create(&self, id: &FlowId) -> Result<FlowInstance, FlowError> {
        let state = self.flow_type(id.name())?.create();
        Ok(FlowInstance::new(id.clone(), 0, steps::STARTING, None, state))
    }

    /// Rebuilds a flow from its persisted parts.
    pub fn restore(
        &self,
        id: &FlowId,
        version: u64,
        step: &str,
        hard_resume_at: Option<DateTime<Utc>>,
        data: serde_json::Value,
    ) -> Result<FlowInstance, FlowError> {
        let state = self.flow_type(id.name())?.restore(data)?;
        Ok(FlowInstance::new(id.clone(), version, step, hard_resume_at, state))
    }

    pub fn list_flow_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("flow_types", &self.list_flow_types())
            .finish()
    }
}

fn short_type_name<F>() -> String {
    let full = std::any::type_name::<F>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
