//! Immutable dispatch tables built once when a service registers.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use rmpv::Value;

use crate::arguments::{ArgumentSpec, ValueType};
use crate::credentials::Credential;
use crate::request::{ConnectionEvent, TransferDescriptor, TransferDirection};
use crate::transfer::TransferSession;

/// What a failing handler hands back; the dispatcher turns it into `S_ERROR`.
pub type HandlerFailure = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<Value, HandlerFailure>;

pub(crate) type AsyncHandlerFn = Arc<
    dyn Fn(CallContext, Vec<Value>) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>>
        + Send
        + Sync,
>;

/// Who is calling and what they called.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub service: Arc<str>,
    pub name: String,
    pub credential: Option<Arc<Credential>>,
    pub peer_addr: Option<SocketAddr>,
}

/// Direction handlers run the service half of a transfer over `session`.
#[async_trait]
pub trait TransferHandler: Send + Sync {
    async fn transfer(
        &self,
        ctx: CallContext,
        descriptor: TransferDescriptor,
        session: &mut TransferSession<'_>,
    ) -> HandlerResult;
}

#[derive(Clone)]
pub(crate) struct Exported {
    pub(crate) handler: AsyncHandlerFn,
    pub(crate) spec: Option<ArgumentSpec>,
    pub(crate) auth_tag: Option<String>,
}

/// A service's exported methods, messages, transfer directions and
/// connection callbacks. Built with [`ServiceHandlerBuilder`] and never
/// mutated afterwards.
pub struct ServiceHandler {
    name: Arc<str>,
    methods: HashMap<String, Exported>,
    messages: HashMap<String, Exported>,
    transfers: HashMap<TransferDirection, Arc<dyn TransferHandler>>,
    callbacks: HashMap<ConnectionEvent, AsyncHandlerFn>,
}

impl fmt::Debug for ServiceHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("ServiceHandler")
            .field("name", &self.name)
            .field("methods", &methods)
            .field("transfers", &self.transfers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ServiceHandler {
    pub fn builder(name: impl Into<String>) -> ServiceHandlerBuilder {
        ServiceHandlerBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        self.name.clone()
    }

    pub(crate) fn method(&self, name: &str) -> Option<&Exported> {
        self.methods.get(name)
    }

    pub(crate) fn message(&self, name: &str) -> Option<&Exported> {
        self.messages.get(name)
    }

    pub(crate) fn transfer(&self, direction: TransferDirection) -> Option<Arc<dyn TransferHandler>> {
        self.transfers.get(&direction).cloned()
    }

    pub(crate) fn callback(&self, event: ConnectionEvent) -> Option<AsyncHandlerFn> {
        self.callbacks.get(&event).cloned()
    }

    pub fn exports(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn supports_transfer(&self, direction: TransferDirection) -> bool {
        self.transfers.contains_key(&direction)
    }
}

/// Fixed argument shape of each connection callback.
pub(crate) fn callback_spec(event: ConnectionEvent) -> ArgumentSpec {
    match event {
        ConnectionEvent::New => ArgumentSpec::from_slots([ValueType::Str, ValueType::Map]),
        ConnectionEvent::Connected | ConnectionEvent::Drop => ArgumentSpec::new(),
    }
}

fn boxed<F, Fut>(handler: F) -> AsyncHandlerFn
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx, args| Box::pin(handler(ctx, args)) as Pin<Box<dyn Future<Output = _> + Send>>)
}

pub struct ServiceHandlerBuilder {
    name: String,
    methods: HashMap<String, Exported>,
    messages: HashMap<String, Exported>,
    transfers: HashMap<TransferDirection, Arc<dyn TransferHandler>>,
    callbacks: HashMap<ConnectionEvent, AsyncHandlerFn>,
}

impl ServiceHandlerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
            messages: HashMap::new(),
            transfers: HashMap::new(),
            callbacks: HashMap::new(),
        }
    }

    /// Exports `method` with no declared argument types.
    pub fn export<F, Fut>(self, method: &str, handler: F) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.export_method(method, None, None, handler)
    }

    /// Exports `method`, checking calls against `spec` first.
    pub fn export_typed<F, Fut>(self, method: &str, spec: ArgumentSpec, handler: F) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.export_method(method, Some(spec), None, handler)
    }

    /// Full form: optional spec and an authorization tag handed to the
    /// dispatcher's [`Authorizer`](crate::dispatcher::Authorizer).
    pub fn export_method<F, Fut>(
        mut self,
        method: &str,
        spec: Option<ArgumentSpec>,
        auth_tag: Option<&str>,
        handler: F,
    ) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.methods.insert(
            method.to_string(),
            Exported {
                handler: boxed(handler),
                spec,
                auth_tag: auth_tag.map(str::to_string),
            },
        );
        self
    }

    pub fn message<F, Fut>(mut self, name: &str, spec: Option<ArgumentSpec>, handler: F) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.messages.insert(
            name.to_string(),
            Exported {
                handler: boxed(handler),
                spec,
                auth_tag: None,
            },
        );
        self
    }

    pub fn transfer<H>(mut self, direction: TransferDirection, handler: H) -> Self
    where
        H: TransferHandler + 'static,
    {
        self.transfers.insert(direction, Arc::new(handler));
        self
    }

    pub fn on_connection<F, Fut>(mut self, event: ConnectionEvent, handler: F) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.callbacks.insert(event, boxed(handler));
        self
    }

    pub fn build(self) -> Arc<ServiceHandler> {
        Arc::new(ServiceHandler {
            name: Arc::from(self.name),
            methods: self.methods,
            messages: self.messages,
            transfers: self.transfers,
            callbacks: self.callbacks,
        })
    }
}
