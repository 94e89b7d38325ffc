//! Static step definitions and node id assignment

use dashmap::DashMap;

use crate::processor::StepUnit;

/// Identity of a node in a route definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDefinition {
    id: Option<String>,
    short_name: String,
    label: Option<String>,
}

impl NodeDefinition {
    pub fn new(short_name: impl Into<String>) -> Self {
        Self {
            id: None,
            short_name: short_name.into(),
            label: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.short_name)
    }

    /// Assign an id from the factory if none was given, then return it
    pub fn ensure_id(&mut self, factory: &NodeIdFactory) -> &str {
        if self.id.is_none() {
            self.id = Some(factory.create_id(&self.short_name));
        }
        self.id.as_deref().unwrap_or_default()
    }
}

/// Hands out `{short_name}{n}` ids with one counter per short name
#[derive(Debug, Default)]
pub struct NodeIdFactory {
    counters: DashMap<String, u64>,
}

impl NodeIdFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_id(&self, short_name: &str) -> String {
        let mut counter = self.counters.entry(short_name.to_string()).or_insert(0);
        *counter += 1;
        format!("{}{}", short_name, *counter)
    }
}

/// One step of a route: its node, an optional child node whose identity is
/// used for tracing, and the processing unit.
#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub node: NodeDefinition,
    pub child: Option<NodeDefinition>,
    pub processor: StepUnit,
    /// Shared with other routes; a channel stop leaves it running
    pub context_scoped: bool,
}

impl StepDefinition {
    pub fn new(node: NodeDefinition, processor: StepUnit) -> Self {
        Self {
            node,
            child: None,
            processor,
            context_scoped: false,
        }
    }

    pub fn with_child(mut self, child: NodeDefinition) -> Self {
        self.child = Some(child);
        self
    }

    pub fn context_scoped(mut self, scoped: bool) -> Self {
        self.context_scoped = scoped;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_counted_per_short_name() {
        let factory = NodeIdFactory::new();
        assert_eq!(factory.create_id("to"), "to1");
        assert_eq!(factory.create_id("log"), "log1");
        assert_eq!(factory.create_id("to"), "to2");
    }

    #[test]
    fn test_explicit_id_is_kept() {
        let factory = NodeIdFactory::new();
        let mut node = NodeDefinition::new("to").with_id("audit");
        assert_eq!(node.ensure_id(&factory), "audit");

        let mut anonymous = NodeDefinition::new("to");
        assert_eq!(anonymous.ensure_id(&factory), "to1");
        assert_eq!(anonymous.label(), "to");
    }
}
