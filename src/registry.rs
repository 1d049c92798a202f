//! Named scheduler contexts.
//!
//! A context bundles the settings, event hooks and sessions of one consumer
//! of the engine, so several applications (or several databases) can coexist
//! in a single process. Contexts live in an explicit [`Registry`] owned by
//! the application; a process-wide [`default_registry`] exists for the
//! common single-application case.

use std::sync::{Arc, Mutex, OnceLock};

use dashmap::DashMap;

use crate::errors::Error;
use crate::events::EventHooks;
use crate::session::SessionProvider;
use crate::settings::Settings;

type ProviderFactory = dyn Fn(&Settings) -> Result<SessionProvider, Error> + Send + Sync;

struct ContextInner {
    name: String,
    settings: Settings,
    hooks: EventHooks,
    provider: Mutex<Option<Arc<SessionProvider>>>,
    provider_factory: Option<Box<ProviderFactory>>,
}

/// A named scheduler context. Cheap to clone; all clones share settings,
/// hooks and the lazily created session provider.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    fn new(
        name: String,
        settings: Settings,
        provider_factory: Option<Box<ProviderFactory>>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                name,
                settings,
                hooks: EventHooks::new(),
                provider: Mutex::new(None),
                provider_factory,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// The event hooks of this context. Register listeners here.
    pub fn hooks(&self) -> &EventHooks {
        &self.inner.hooks
    }

    /// The session provider, created on first use and cached for the
    /// lifetime of the context.
    pub fn session(&self) -> Result<Arc<SessionProvider>, Error> {
        let mut cached = self.inner.provider.lock().expect("session provider lock");
        if let Some(provider) = cached.as_ref() {
            return Ok(provider.clone());
        }

        let provider = match &self.inner.provider_factory {
            Some(factory) => factory(&self.inner.settings)?,
            None => SessionProvider::connect(&self.inner.settings)?,
        };
        let provider = Arc::new(provider);
        *cached = Some(provider.clone());
        Ok(provider)
    }

    /// Run the schema migrations for this context's database.
    pub async fn migrate(&self) -> Result<(), Error> {
        self.session()?.migrate().await
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("name", &self.inner.name).finish()
    }
}

/// Holds named contexts. Applications own a registry and hand it (or the
/// contexts from it) to their schedulers.
#[derive(Default)]
pub struct Registry {
    contexts: DashMap<String, Context>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            contexts: DashMap::new(),
        }
    }

    /// Register a new context. Fails if the name is taken or the settings
    /// don't validate.
    pub fn register(&self, name: &str, settings: Settings) -> Result<Context, Error> {
        self.register_with(name, settings, None)
    }

    /// Register a context with a custom session provider factory (e.g. a
    /// provider pointed at a pre-built pool in tests).
    pub fn register_with_factory(
        &self,
        name: &str,
        settings: Settings,
        factory: impl Fn(&Settings) -> Result<SessionProvider, Error> + Send + Sync + 'static,
    ) -> Result<Context, Error> {
        self.register_with(name, settings, Some(Box::new(factory)))
    }

    fn register_with(
        &self,
        name: &str,
        settings: Settings,
        factory: Option<Box<ProviderFactory>>,
    ) -> Result<Context, Error> {
        settings.validate()?;

        if self.contexts.contains_key(name) {
            return Err(Error::ContextAlreadyExists(name.to_string()));
        }

        let context = Context::new(name.to_string(), settings, factory);
        self.contexts.insert(name.to_string(), context.clone());
        Ok(context)
    }

    pub fn context(&self, name: &str) -> Result<Context, Error> {
        self.contexts
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownContext(name.to_string()))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.contexts.contains_key(name)
    }

    /// Get an existing context or register it with the given settings.
    pub fn get_or_register(
        &self,
        name: &str,
        settings: impl FnOnce() -> Settings,
    ) -> Result<Context, Error> {
        if let Some(entry) = self.contexts.get(name) {
            return Ok(entry.value().clone());
        }
        self.register(name, settings())
    }
}

/// The process-wide registry for applications that don't need their own.
pub fn default_registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}
