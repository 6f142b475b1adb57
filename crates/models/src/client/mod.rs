//! The client entry point: a name-keyed registry of models sharing one
//! transport.

use std::{
    any::Any,
    collections::HashMap,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    errors::ModelError,
    model::{
        Model,
        ModelSpec,
    },
    options::ClientOptions,
    transport::Transport,
};

const VERSION: Option<&str> = option_env!("CARGO_PKG_VERSION");

/// Owns the transport handle and the model registry.
///
/// Create one per connection and reuse it; models are de-duplicated by name,
/// so repeated `get` calls with the same name return the same model.
pub struct ModelsClient {
    registry: ModelsRegistry,
}

impl ModelsClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_options(transport, ClientOptions::default())
    }

    pub fn with_options(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        transport.set_agent(&format!("models-rust/{}", VERSION.unwrap_or("unknown")));
        Self {
            registry: ModelsRegistry {
                transport,
                options,
                models: Mutex::new(HashMap::new()),
            },
        }
    }

    pub fn models(&self) -> &ModelsRegistry {
        &self.registry
    }
}

/// The name-keyed model registry.
pub struct ModelsRegistry {
    transport: Arc<dyn Transport>,
    options: ClientOptions,
    models: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl ModelsRegistry {
    /// Returns the model registered under `spec.name`, creating it on first
    /// use. Spec fields are not re-validated once the model exists; the
    /// caller is responsible for keeping channel, sync and merge consistent
    /// for a given name.
    pub fn get<T: Clone + Send + Sync + 'static>(
        &self,
        spec: ModelSpec<T>,
    ) -> Result<Model<T>, ModelError> {
        if spec.name.is_empty() {
            return Err(ModelError::InvalidArgument(
                "model name must not be empty".to_string(),
            ));
        }
        if spec.channel_name.is_empty() {
            return Err(ModelError::InvalidArgument(
                "channel name must not be empty".to_string(),
            ));
        }

        let mut models = self.models.lock();
        if let Some(existing) = models.get(&spec.name) {
            return existing
                .downcast_ref::<Model<T>>()
                .cloned()
                .ok_or_else(|| {
                    ModelError::InvalidArgument(format!(
                        "model `{}` is already registered with a different data type",
                        spec.name
                    ))
                });
        }

        let channel = self.transport.channel(&spec.channel_name);
        let model = Model::spawn(spec, self.transport.clone(), channel, self.options.clone());
        models.insert(model.name().to_string(), Box::new(model.clone()));
        Ok(model)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.models.lock().len()
    }
}
