//! Components and the handler registry.
//!
//! A component bundles the handlers of one service plus lifecycle hooks.
//! Handlers come in two shapes, mirroring the two argument forms the
//! dispatcher understands:
//!
//! * **typed** — the payload is deserialized through the node serializer
//!   into the handler's declared argument type;
//! * **raw** — the handler receives the payload bytes as-is (the
//!   dispatcher hands it an owned copy, so handlers may keep it).
//!
//! Registration is explicit rather than reflective: a component lists its
//! handlers in [`Component::handlers`], and the node builds the routing
//! table `Service.Method -> handler` at startup. Lifecycle hooks run in
//! registration order at startup and reverse order at shutdown.
//!
//! ```ignore
//! struct Room;
//!
//! impl Component for Room {
//!     fn name(&self) -> &'static str { "Room" }
//!
//!     fn handlers(&self, registry: &mut HandlerRegistry) {
//!         registry.register("Join", |session, msg: JoinRequest| {
//!             // ...
//!             Ok(())
//!         });
//!         registry.register_raw("Blob", |_session, bytes| {
//!             // bytes is an owned copy of the payload
//!             Ok(())
//!         });
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::env::NodeEnv;
use crate::error::ServerError;
use crate::serialize;
use crate::session::Session;

type HandlerFn = Box<dyn Fn(&Arc<Session>, Vec<u8>, &Arc<NodeEnv>) -> Result<(), ServerError> + Send + Sync>;

/// One invokable handler, already wrapped for uniform dispatch.
pub struct Handler {
    method: String,
    is_raw: bool,
    call: HandlerFn,
}

impl Handler {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_raw(&self) -> bool {
        self.is_raw
    }

    pub(crate) fn call(
        &self,
        session: &Arc<Session>,
        payload: Vec<u8>,
        env: &Arc<NodeEnv>,
    ) -> Result<(), ServerError> {
        (self.call)(session, payload, env)
    }
}

/// Collects the handlers of one component during registration.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Handler>,
}

impl HandlerRegistry {
    /// Register a typed handler. The payload is deserialized through the
    /// node serializer into `T` before the call.
    pub fn register<T, F>(&mut self, method: &str, handler: F) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(&Arc<Session>, T) -> Result<(), ServerError> + Send + Sync + 'static,
    {
        let call: HandlerFn = Box::new(move |session, payload, env| {
            let value: T = serialize::unmarshal(env.serializer.as_ref(), &payload)?;
            handler(session, value)
        });
        self.handlers.push(Handler {
            method: method.to_string(),
            is_raw: false,
            call,
        });
        self
    }

    /// Register a raw handler receiving the payload bytes unmodified.
    pub fn register_raw<F>(&mut self, method: &str, handler: F) -> &mut Self
    where
        F: Fn(&Arc<Session>, Vec<u8>) -> Result<(), ServerError> + Send + Sync + 'static,
    {
        let call: HandlerFn = Box::new(move |session, payload, _env| handler(session, payload));
        self.handlers.push(Handler {
            method: method.to_string(),
            is_raw: true,
            call,
        });
        self
    }
}

/// A user-supplied bundle of handlers with lifecycle hooks.
///
/// `name` conventionally matches the implementing type, giving routes of
/// the familiar `TypeName.MethodName` shape; overrides and transforms are
/// applied through [`ComponentOptions`].
pub trait Component: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn handlers(&self, registry: &mut HandlerRegistry);

    /// Called on startup, in component registration order.
    fn init(&self) {}

    /// Called after every component's `init` has run.
    fn after_init(&self) {}

    /// Called at shutdown, in reverse registration order.
    fn before_shutdown(&self) {}

    /// Called last, in reverse registration order.
    fn shutdown(&self) {}
}

type NameTransform = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Per-component registration options.
#[derive(Clone, Default)]
pub struct ComponentOptions {
    name: Option<String>,
    name_transform: Option<NameTransform>,
    scheduler_name: Option<String>,
}

impl ComponentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the component's own service name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Rewrite the service name, e.g. `str::to_lowercase`.
    pub fn with_name_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.name_transform = Some(Arc::new(transform));
        self
    }

    /// Route this service's invocations through the session scheduler
    /// capability of the given name instead of the main scheduler.
    pub fn with_scheduler_name(mut self, name: impl Into<String>) -> Self {
        self.scheduler_name = Some(name.into());
        self
    }
}

/// Ordered component list handed to the node.
#[derive(Default)]
pub struct Components {
    list: Vec<(Arc<dyn Component>, ComponentOptions)>,
}

impl Components {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, component: impl Component) -> &mut Self {
        self.register_with(component, ComponentOptions::default())
    }

    pub fn register_with(&mut self, component: impl Component, options: ComponentOptions) -> &mut Self {
        self.list.push((Arc::new(component), options));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub(crate) fn list(&self) -> &[(Arc<dyn Component>, ComponentOptions)] {
        &self.list
    }
}

/// A registered service: resolved name, extracted handlers, scheduling.
pub(crate) struct Service {
    pub name: String,
    pub scheduler_name: Option<String>,
    pub handlers: HashMap<String, Arc<Handler>>,
}

impl Service {
    pub(crate) fn build(
        component: Arc<dyn Component>,
        options: &ComponentOptions,
    ) -> Result<Self, ServerError> {
        let base = options
            .name
            .clone()
            .unwrap_or_else(|| component.name().to_string());
        let name = match &options.name_transform {
            Some(transform) => transform(&base),
            None => base,
        };
        if name.is_empty() || name.contains('.') {
            return Err(ServerError::InvalidRoute(name));
        }

        let mut registry = HandlerRegistry::default();
        component.handlers(&mut registry);

        let mut handlers = HashMap::new();
        for handler in registry.handlers {
            if handler.method.is_empty() || handler.method.contains('.') {
                return Err(ServerError::InvalidRoute(format!("{name}.{}", handler.method)));
            }
            let method = handler.method.clone();
            if handlers.insert(method.clone(), Arc::new(handler)).is_some() {
                return Err(ServerError::DuplicateHandler {
                    service: name,
                    method,
                });
            }
        }

        Ok(Self {
            name,
            scheduler_name: options.scheduler_name.clone(),
            handlers,
        })
    }

    /// Method names sorted for stable display.
    pub(crate) fn sorted_methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }
}
