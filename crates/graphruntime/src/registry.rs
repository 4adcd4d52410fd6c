use crate::DefinitionError;
use graphcore::{Graph, GraphError, NodeError, NodeHandler, Value};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Free-form template configuration, passed through unopened
pub type TemplateConfig = BTreeMap<String, Value>;

/// Graph-construction recipe
pub trait Template: Send + Sync {
    /// Unique template identifier
    fn template_id(&self) -> &str;

    /// Human-readable name
    fn template_name(&self) -> &str;

    fn description(&self) -> &str;

    /// Build an uncompiled graph for one instance
    fn build_graph(&self, config: &TemplateConfig) -> Result<Graph, GraphError>;
}

/// Listing entry of a registered template
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateInfo {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// Registry of available templates
pub struct TemplateRegistry {
    templates: HashMap<String, Arc<dyn Template>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    /// Register a template, replacing any template with the same id
    pub fn register(&mut self, template: Arc<dyn Template>) {
        let template_id = template.template_id().to_string();
        tracing::info!("Registering template: {}", template_id);
        self.templates.insert(template_id, template);
    }

    pub fn get(&self, template_id: &str) -> Option<Arc<dyn Template>> {
        self.templates.get(template_id).cloned()
    }

    /// All templates, sorted by id
    pub fn list(&self) -> Vec<TemplateInfo> {
        let mut infos: Vec<TemplateInfo> = self
            .templates
            .values()
            .map(|t| TemplateInfo {
                id: t.template_id().to_string(),
                name: t.template_name().to_string(),
                description: t.description().to_string(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Factory trait for creating handlers from configuration
pub trait HandlerFactory: Send + Sync {
    /// Handler type identifier
    fn handler_type(&self) -> &str;

    /// Create a handler with the given configuration
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Arc<dyn NodeHandler>, NodeError>;

    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::default()
    }
}

/// Metadata about a handler type
#[derive(Debug, Clone)]
pub struct HandlerMetadata {
    pub description: String,
    pub category: String,
}

impl Default for HandlerMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

/// Registry of handler types usable from graph definitions
pub struct HandlerRegistry {
    factories: HashMap<String, Arc<dyn HandlerFactory>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, factory: Arc<dyn HandlerFactory>) {
        let handler_type = factory.handler_type().to_string();
        tracing::debug!("Registering handler type: {}", handler_type);
        self.factories.insert(handler_type, factory);
    }

    pub fn create_handler(
        &self,
        handler_type: &str,
        config: &BTreeMap<String, Value>,
    ) -> Result<Arc<dyn NodeHandler>, DefinitionError> {
        let factory = self
            .factories
            .get(handler_type)
            .ok_or_else(|| DefinitionError::UnknownHandlerType(handler_type.to_string()))?;

        factory
            .create(config)
            .map_err(|source| DefinitionError::Handler {
                handler_type: handler_type.to_string(),
                source,
            })
    }

    /// Registered handler types, sorted
    pub fn list_handler_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn get_metadata(&self, handler_type: &str) -> Option<HandlerMetadata> {
        self.factories.get(handler_type).map(|f| f.metadata())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
