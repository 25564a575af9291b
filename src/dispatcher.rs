//! Routes one action proposal to its handler and answers it.
//!
//! For RPC and Message actions the order is fixed: resolve the name,
//! authorize, validate arguments, take the method lock, invoke, check the
//! result envelope, then send exactly one reply.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use rmpv::Value;
use tracing::{debug, error, info, warn};

use crate::arguments::ArgumentLogPolicy;
use crate::codec::{send_message, MessageChannel};
use crate::config::TransportConfig;
use crate::credentials::Credential;
use crate::errors::{DispatchError, TransportError};
use crate::handler::{callback_spec, AsyncHandlerFn, CallContext, Exported, HandlerResult, ServiceHandler};
use crate::locks::MethodLockTable;
use crate::request::{ActionProposal, ActionType, ConnectionEvent};
use crate::response::Envelope;

/// What an [`Authorizer`] is asked to approve.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizationRequest<'a> {
    pub service: &'a str,
    pub action: ActionType,
    pub name: &'a str,
    pub auth_tag: Option<&'a str>,
    pub credential: Option<&'a Credential>,
}

/// Policy hook consulted before any handler runs. `Err` carries the reason
/// reported to the peer.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, request: &AuthorizationRequest<'_>) -> Result<(), String>;
}

impl<F> Authorizer for F
where
    F: Fn(&AuthorizationRequest<'_>) -> Result<(), String> + Send + Sync,
{
    fn authorize(&self, request: &AuthorizationRequest<'_>) -> Result<(), String> {
        self(request)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _request: &AuthorizationRequest<'_>) -> Result<(), String> {
        Ok(())
    }
}

/// State shared by every connection worker of one or more services: the
/// method lock table, the authorizer and logging settings.
pub struct DispatcherState {
    locks: MethodLockTable,
    authorizer: Arc<dyn Authorizer>,
    log_policy: ArgumentLogPolicy,
}

impl fmt::Debug for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherState")
            .field("locks", &self.locks.len())
            .field("log_policy", &self.log_policy)
            .finish()
    }
}

impl Default for DispatcherState {
    fn default() -> Self {
        DispatcherStateBuilder::default().finish()
    }
}

impl DispatcherState {
    pub fn builder() -> DispatcherStateBuilder {
        DispatcherStateBuilder::default()
    }

    pub fn locks(&self) -> &MethodLockTable {
        &self.locks
    }

    pub fn log_policy(&self) -> ArgumentLogPolicy {
        self.log_policy
    }

    pub(crate) fn authorize(&self, request: &AuthorizationRequest<'_>) -> Result<(), DispatchError> {
        self.authorizer
            .authorize(request)
            .map_err(|reason| DispatchError::Unauthorized {
                name: request.name.to_string(),
                reason,
            })
    }
}

pub struct DispatcherStateBuilder {
    authorizer: Arc<dyn Authorizer>,
    log_policy: ArgumentLogPolicy,
}

impl Default for DispatcherStateBuilder {
    fn default() -> Self {
        Self {
            authorizer: Arc::new(AllowAll),
            log_policy: ArgumentLogPolicy::default(),
        }
    }
}

impl DispatcherStateBuilder {
    pub fn authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    pub fn log_policy(mut self, policy: ArgumentLogPolicy) -> Self {
        self.log_policy = policy;
        self
    }

    pub fn build(self) -> Arc<DispatcherState> {
        Arc::new(self.finish())
    }

    fn finish(self) -> DispatcherState {
        DispatcherState {
            locks: MethodLockTable::new(),
            authorizer: self.authorizer,
            log_policy: self.log_policy,
        }
    }
}

/// The reply that was sent for one proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub action: ActionType,
    pub name: String,
    pub response: Envelope,
    /// Time spent inside the handler; zero when it never ran.
    pub elapsed: Duration,
}

impl ActionOutcome {
    pub fn is_ok(&self) -> bool {
        self.response.is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct RequestDispatcher {
    handler: Arc<ServiceHandler>,
    state: Arc<DispatcherState>,
    transfer_chunk_size: usize,
}

impl RequestDispatcher {
    pub fn new(handler: Arc<ServiceHandler>, state: Arc<DispatcherState>) -> Self {
        Self {
            handler,
            state,
            transfer_chunk_size: TransportConfig::default().transfer_chunk_size,
        }
    }

    /// Chunk size for data this service streams; servers take it from
    /// their listener's [`TransportConfig`].
    pub fn with_transfer_chunk_size(mut self, size: usize) -> Self {
        self.transfer_chunk_size = size.max(1);
        self
    }

    pub fn transfer_chunk_size(&self) -> usize {
        self.transfer_chunk_size
    }

    pub fn handler(&self) -> &Arc<ServiceHandler> {
        &self.handler
    }

    pub fn state(&self) -> &Arc<DispatcherState> {
        &self.state
    }

    pub(crate) fn context(&self, channel: &dyn MessageChannel, name: &str) -> CallContext {
        CallContext {
            service: self.handler.name_arc(),
            name: name.to_string(),
            credential: channel.peer_credential(),
            peer_addr: channel.peer_addr(),
        }
    }

    /// Runs `proposal` and sends its reply on `channel`.
    ///
    /// Request-level failures are answered with `S_ERROR` and reported in
    /// the outcome. `Err` means the channel itself failed and must be
    /// closed.
    pub async fn execute_action(
        &self,
        channel: &mut dyn MessageChannel,
        proposal: ActionProposal,
    ) -> Result<ActionOutcome, TransportError> {
        let action = proposal.action();
        let name = proposal.name().to_string();
        debug!(service = %self.handler.name(), %action, %name, "Executing action");

        let ctx = self.context(&*channel, &name);
        let (response, elapsed) = match action {
            ActionType::FileTransfer => {
                return crate::transfer::serve_transfer(self, channel, ctx).await
            }
            ActionType::Rpc | ActionType::Message => self.run_exported(ctx, proposal).await,
            ActionType::Connection => self.run_callback(ctx, proposal).await,
        };

        send_message(channel, &response.clone().into_value()).await?;
        Ok(ActionOutcome {
            action,
            name,
            response,
            elapsed,
        })
    }

    async fn run_exported(&self, ctx: CallContext, proposal: ActionProposal) -> (Envelope, Duration) {
        let action = proposal.action();
        let name = proposal.name().to_string();
        let (exported, lock_key) = match action {
            ActionType::Message => (
                self.handler.message(&name),
                MethodLockTable::message_key(self.handler.name(), &name),
            ),
            _ => (
                self.handler.method(&name),
                MethodLockTable::rpc_key(self.handler.name(), &name),
            ),
        };
        let Some(Exported {
            handler,
            spec,
            auth_tag,
        }) = exported.cloned()
        else {
            let err = match action {
                ActionType::Message => DispatchError::UnknownMessage(name),
                _ => DispatchError::UnknownMethod(name),
            };
            warn!(service = %self.handler.name(), "{err}");
            return (err.into(), Duration::ZERO);
        };

        let request = AuthorizationRequest {
            service: self.handler.name(),
            action,
            name: &name,
            auth_tag: auth_tag.as_deref(),
            credential: ctx.credential.as_deref(),
        };
        if let Err(err) = self.state.authorize(&request) {
            warn!(service = %self.handler.name(), peer = ?ctx.peer_addr, "{err}");
            return (err.into(), Duration::ZERO);
        }

        let args = proposal.into_args();
        if let Some(spec) = &spec {
            if let Err(err) = spec.validate(&name, &args) {
                debug!(service = %self.handler.name(), "{err}");
                return (err.into(), Duration::ZERO);
            }
        }

        let summary = self.state.log_policy.summarize(&args);
        let _guard = self.state.locks.acquire(lock_key).await;
        let started = Instant::now();
        let result = invoke(&handler, ctx, args).await;
        let elapsed = started.elapsed();

        let response = match shape_result(&name, result) {
            Ok(inner) => {
                Envelope::ok(Value::Array(vec![inner, Value::F64(elapsed.as_secs_f64())]))
            }
            Err(err) => {
                error!(service = %self.handler.name(), method = %name, "{err}");
                err.into()
            }
        };
        info!(
            service = %self.handler.name(),
            %action,
            method = %name,
            args = %summary,
            elapsed_ms = elapsed.as_millis() as u64,
            ok = response.is_ok(),
            "Served request"
        );
        (response, elapsed)
    }

    async fn run_callback(&self, ctx: CallContext, proposal: ActionProposal) -> (Envelope, Duration) {
        let name = proposal.name().to_string();
        let event = match ConnectionEvent::from_str(&name) {
            Ok(event) => event,
            Err(unknown) => return (DispatchError::UnknownCallback(unknown).into(), Duration::ZERO),
        };
        let args = proposal.into_args();
        if let Err(err) = callback_spec(event).validate(&name, &args) {
            return (err.into(), Duration::ZERO);
        }

        let Some(callback) = self.handler.callback(event) else {
            return (Envelope::ok(Value::Nil), Duration::ZERO);
        };

        let started = Instant::now();
        let result = invoke(&callback, ctx, args).await;
        let elapsed = started.elapsed();
        let response = match shape_result(&name, result) {
            Ok(inner) => Envelope::from_value(inner).unwrap_or_else(Envelope::error),
            Err(err) => {
                error!(service = %self.handler.name(), callback = %name, "{err}");
                err.into()
            }
        };
        (response, elapsed)
    }

    /// Invokes the `drop` callback for a peer that registered with
    /// `Connection/new` and has gone away.
    pub async fn connection_dropped(
        &self,
        credential: Option<Arc<Credential>>,
        peer_addr: Option<SocketAddr>,
    ) {
        let Some(callback) = self.handler.callback(ConnectionEvent::Drop) else {
            return;
        };
        let ctx = CallContext {
            service: self.handler.name_arc(),
            name: ConnectionEvent::Drop.as_str().to_string(),
            credential,
            peer_addr,
        };
        if let Err(err) = shape_result("drop", invoke(&callback, ctx, Vec::new()).await) {
            warn!(service = %self.handler.name(), "{err}");
        }
    }
}

/// Runs a handler future, turning both `Err` and panics into the failure
/// text reported to the peer.
pub(crate) async fn invoke(handler: &AsyncHandlerFn, ctx: CallContext, args: Vec<Value>) -> Result<Value, String> {
    let name = ctx.name.clone();
    guard_handler(&name, || handler(ctx, args)).await
}

pub(crate) async fn guard_handler<F, Fut>(name: &str, start: F) -> Result<Value, String>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = HandlerResult>,
{
    let future = match std::panic::catch_unwind(AssertUnwindSafe(start)) {
        Ok(future) => future,
        Err(panic) => return Err(panic_message(panic)),
    };
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(failure)) => {
            error!(handler = %name, "Handler raised: {failure:?}");
            Err(failure.to_string())
        }
        Err(panic) => {
            let message = panic_message(panic);
            error!(handler = %name, "Handler panicked: {message}");
            Err(message)
        }
    }
}

/// Checks a handler outcome and returns the validated raw envelope.
pub(crate) fn shape_result(name: &str, result: Result<Value, String>) -> Result<Value, DispatchError> {
    let value = result.map_err(|cause| DispatchError::HandlerFailed {
        name: name.to_string(),
        cause,
    })?;
    Envelope::from_value(value.clone()).map_err(|reason| DispatchError::MalformedResult {
        name: name.to_string(),
        reason,
    })?;
    Ok(value)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::arguments::{ArgumentSpec, ValueType};
    use crate::handler::HandlerFailure;
    use crate::codec::{decode, encode};
    use crate::response::{s_error, s_ok};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout};

    /// Records sent frames and replays queued inbound ones.
    #[derive(Default)]
    pub(crate) struct MemoryChannel {
        pub(crate) inbound: VecDeque<Bytes>,
        pub(crate) sent: Vec<Bytes>,
    }

    impl MemoryChannel {
        pub(crate) fn push<T: serde::Serialize>(&mut self, message: &T) {
            self.inbound.push_back(encode(message).unwrap());
        }

        pub(crate) fn sent_values(&self) -> Vec<Value> {
            self.sent.iter().map(|frame| decode(frame).unwrap()).collect()
        }
    }

    #[async_trait]
    impl MessageChannel for MemoryChannel {
        async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
            self.sent.push(frame);
            Ok(())
        }

        async fn receive_frame(&mut self) -> Result<Bytes, TransportError> {
            self.inbound.pop_front().ok_or(TransportError::PeerClosed)
        }

        fn peer_credential(&self) -> Option<Arc<Credential>> {
            None
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    fn echo_service(calls: Arc<AtomicUsize>) -> Arc<ServiceHandler> {
        ServiceHandler::builder("Test/Echo")
            .export_typed("ping", ArgumentSpec::new(), |_ctx, _args| async {
                Ok(s_ok(Value::Map(vec![(Value::from("alive"), Value::Boolean(true))])))
            })
            .export_typed(
                "echo",
                ArgumentSpec::new().arg(ValueType::Str),
                move |_ctx, args| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(s_ok(args[0].clone()))
                    }
                },
            )
            .export("explode", |_ctx, _args| async {
                Err::<Value, HandlerFailure>("disk on fire".into())
            })
            .export("panics", |_ctx, _args| async { panic!("lost the plot") })
            .export("bare", |_ctx, _args| async { Ok(Value::from(7)) })
            .export("refuses", |_ctx, _args| async { Ok(s_error("not today")) })
            .build()
    }

    async fn run(dispatcher: &RequestDispatcher, proposal: ActionProposal) -> ActionOutcome {
        let mut channel = MemoryChannel::default();
        let outcome = dispatcher.execute_action(&mut channel, proposal).await.unwrap();
        assert_eq!(channel.sent.len(), 1, "exactly one reply per request");
        assert_eq!(channel.sent_values()[0], outcome.response.clone().into_value());
        outcome
    }

    fn unwrap_timed(outcome: &ActionOutcome) -> (Envelope, f64) {
        let Some(Value::Array(pair)) = outcome.response.value() else {
            panic!("expected S_OK([inner, elapsed]), got {:?}", outcome.response);
        };
        let inner = Envelope::from_value(pair[0].clone()).unwrap();
        (inner, pair[1].as_f64().unwrap())
    }

    #[tokio::test]
    async fn ping_returns_timed_result() {
        let dispatcher = RequestDispatcher::new(echo_service(Arc::default()), DispatcherState::default().into());
        let outcome = run(&dispatcher, ActionProposal::rpc("ping", vec![])).await;

        let (inner, elapsed) = unwrap_timed(&outcome);
        assert!(inner.is_ok());
        assert!(elapsed >= 0.0);
    }

    #[tokio::test]
    async fn echo_checks_argument_types_before_running() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = RequestDispatcher::new(echo_service(calls.clone()), Arc::default());

        let outcome = run(&dispatcher, ActionProposal::rpc("echo", vec![Value::from("hello")])).await;
        let (inner, _) = unwrap_timed(&outcome);
        assert_eq!(inner, Envelope::ok("hello"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let outcome = run(&dispatcher, ActionProposal::rpc("echo", vec![Value::from(42)])).await;
        assert!(!outcome.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn too_few_arguments_mentions_the_minimum() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = RequestDispatcher::new(echo_service(calls.clone()), Arc::default());

        let outcome = run(&dispatcher, ActionProposal::rpc("echo", vec![])).await;
        assert!(outcome.response.message().unwrap().contains("at least 1"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_names_are_rejected() {
        let dispatcher = RequestDispatcher::new(echo_service(Arc::default()), Arc::default());

        let outcome = run(&dispatcher, ActionProposal::rpc("missing", vec![])).await;
        assert_eq!(outcome.response.message(), Some("Unknown method missing"));

        let outcome = run(&dispatcher, ActionProposal::message("missing", vec![])).await;
        assert_eq!(outcome.response.message(), Some("Unknown message missing"));
    }

    #[tokio::test]
    async fn handler_failures_name_the_method() {
        let dispatcher = RequestDispatcher::new(echo_service(Arc::default()), Arc::default());

        let outcome = run(&dispatcher, ActionProposal::rpc("explode", vec![])).await;
        assert_eq!(
            outcome.response.message(),
            Some("Server error while serving explode: disk on fire")
        );

        let outcome = run(&dispatcher, ActionProposal::rpc("panics", vec![])).await;
        let message = outcome.response.message().unwrap();
        assert!(message.contains("panics") && message.contains("lost the plot"));

        let outcome = run(&dispatcher, ActionProposal::rpc("ping", vec![])).await;
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn malformed_results_are_replaced() {
        let dispatcher = RequestDispatcher::new(echo_service(Arc::default()), Arc::default());
        let outcome = run(&dispatcher, ActionProposal::rpc("bare", vec![])).await;
        assert!(outcome.response.message().unwrap().contains("malformed result"));
    }

    #[tokio::test]
    async fn handler_s_error_is_wrapped_not_replaced() {
        let dispatcher = RequestDispatcher::new(echo_service(Arc::default()), Arc::default());
        let outcome = run(&dispatcher, ActionProposal::rpc("refuses", vec![])).await;
        let (inner, _) = unwrap_timed(&outcome);
        assert_eq!(inner.message(), Some("not today"));
    }

    #[tokio::test]
    async fn authorizer_runs_before_the_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let state = DispatcherState::builder()
            .authorizer(|request: &AuthorizationRequest<'_>| {
                if request.name == "echo" {
                    Err("anonymous peers may not echo".to_string())
                } else {
                    Ok(())
                }
            })
            .build();
        let dispatcher = RequestDispatcher::new(echo_service(calls.clone()), state);

        let outcome = run(&dispatcher, ActionProposal::rpc("echo", vec![Value::from("x")])).await;
        assert!(outcome.response.message().unwrap().contains("Unauthorized"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    fn counting_service(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Arc<ServiceHandler> {
        let slow = move |_ctx: CallContext, _args: Vec<Value>| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(s_ok(Value::Nil))
            }
        };
        ServiceHandler::builder("Test/Slow")
            .export("first", slow.clone())
            .export("second", slow)
            .build()
    }

    #[tokio::test]
    async fn same_method_calls_never_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let dispatcher = RequestDispatcher::new(counting_service(active, peak.clone()), Arc::default());

        let calls = (0..4).map(|_| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { run(&dispatcher, ActionProposal::rpc("first", vec![])).await })
        });
        for call in calls {
            assert!(call.await.unwrap().is_ok());
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_methods_run_concurrently() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let dispatcher = RequestDispatcher::new(counting_service(active, peak.clone()), Arc::default());

        let first = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { run(&dispatcher, ActionProposal::rpc("first", vec![])).await })
        };
        let second = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { run(&dispatcher, ActionProposal::rpc("second", vec![])).await })
        };

        let both = timeout(Duration::from_secs(5), async { (first.await, second.await) }).await;
        let (first, second) = both.expect("no deadlock");
        assert!(first.unwrap().is_ok() && second.unwrap().is_ok());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connection_callbacks_are_optional_but_checked() {
        let dispatcher = RequestDispatcher::new(echo_service(Arc::default()), Arc::default());

        let registration = vec![Value::from("client-1"), Value::Map(vec![])];
        let outcome = run(&dispatcher, ActionProposal::connection(ConnectionEvent::New, registration)).await;
        assert_eq!(outcome.response, Envelope::ok(Value::Nil));

        let outcome = run(&dispatcher, ActionProposal::connection(ConnectionEvent::New, vec![])).await;
        assert!(!outcome.is_ok());

        let outcome = run(&dispatcher, ActionProposal::new(ActionType::Connection, "reconnect", vec![])).await;
        assert!(outcome.response.message().unwrap().contains("reconnect"));
    }

    #[tokio::test]
    async fn messages_use_their_own_table() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler = ServiceHandler::builder("Test/Messages")
            .message("tick", Some(ArgumentSpec::new().arg(ValueType::Int)), move |_ctx, _args| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(s_ok(Value::Nil))
                }
            })
            .build();
        let dispatcher = RequestDispatcher::new(handler, Arc::default());

        let outcome = run(&dispatcher, ActionProposal::message("tick", vec![Value::from(1)])).await;
        assert!(unwrap_timed(&outcome).0.is_ok());
        let outcome = run(&dispatcher, ActionProposal::rpc("tick", vec![Value::from(1)])).await;
        assert!(!outcome.is_ok());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_state_matches_default_builder() {
        let state = DispatcherState::default();
        assert!(state.locks().is_empty());
        assert_eq!(state.log_policy(), ArgumentLogPolicy::default());

        let shared: Arc<DispatcherState> = Arc::default();
        assert_eq!(shared.log_policy(), DispatcherState::builder().build().log_policy());
    }

    #[test]
    fn transfer_chunk_size_follows_transport_config() {
        let dispatcher = RequestDispatcher::new(echo_service(Arc::default()), Arc::default());
        assert_eq!(
            dispatcher.transfer_chunk_size(),
            TransportConfig::default().transfer_chunk_size
        );

        let dispatcher = dispatcher.with_transfer_chunk_size(0);
        assert_eq!(dispatcher.transfer_chunk_size(), 1);
    }
}
