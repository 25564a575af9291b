//! Secure RPC transport and request dispatch for grid services.
//!
//! A [`TransportListener`] produces mutually authenticated
//! [`SecureConnection`]s, each carrying the peer's [`Credential`]. A
//! [`ServiceServer`] reads [`ActionProposal`]s from every connection in
//! arrival order and hands them to a [`RequestDispatcher`], which routes
//! RPC calls, messages, connection callbacks and file transfers to the
//! tables of a [`ServiceHandler`]. Every answer is an `S_OK` / `S_ERROR`
//! [`Envelope`]; RPC and message results are wrapped as
//! `S_OK([result, elapsedSeconds])`.
//!
//! ```text
//! let handler = ServiceHandler::builder("Framework/Ping")
//!     .export_typed("echo", ArgumentSpec::new().arg(ValueType::Str), |_ctx, args| async move {
//!         Ok(s_ok(args[0].clone()))
//!     })
//!     .build();
//! let context = Arc::new(ServerTlsContext::new(TlsSource::files(cert, key, ca))?);
//! let listener = TransportListener::bind("0.0.0.0:9135", context, TransportConfig::default()).await?;
//! ServiceServer::new(listener, handler, DispatcherState::default().into()).serve().await?;
//! ```

pub mod arguments;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod dispatcher;
pub mod errors;
pub mod handler;
pub mod listener;
pub mod locks;
pub mod request;
pub mod response;
pub mod server;
pub mod tls;
pub mod transfer;

pub use arguments::{ArgumentLogPolicy, ArgumentSpec, TypeConstraint, ValueType};
pub use client::RpcClient;
pub use codec::MessageChannel;
pub use config::{TlsMaterial, TlsSource, TransportConfig};
pub use connection::{HandshakeState, Role, SecureConnection};
pub use credentials::{extract_credential, Credential};
pub use dispatcher::{
    ActionOutcome, AllowAll, AuthorizationRequest, Authorizer, DispatcherState, RequestDispatcher,
};
pub use errors::{ConfigError, CredentialError, DispatchError, TransferError, TransportError};
pub use handler::{CallContext, HandlerFailure, HandlerResult, ServiceHandler, TransferHandler};
pub use listener::TransportListener;
pub use locks::MethodLockTable;
pub use request::{ActionProposal, ActionType, ConnectionEvent, TransferDescriptor, TransferDirection};
pub use response::{s_error, s_ok, Envelope};
pub use rmpv::Value;
pub use server::{AcceptMode, ServiceServer};
pub use tls::{ClientTlsContext, ServerTlsContext};
pub use transfer::{TransferItem, TransferSession};
