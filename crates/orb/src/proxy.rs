//! Remote invocation.
//!
//! A [`Proxy`] binds one resolved reference to the engine's connection
//! manager and registries. Per call it picks the first reachable internet
//! profile in listed order, builds the request frame (arguments encoded
//! against the registered operation signature), correlates the reply by
//! request id, and folds reply-carried exceptions back into [`OrbError`].
//! LocationForward replies rebind the call to the forwarded profile list
//! for a bounded number of hops.
//!
//! Connection-scoped service contexts ride on the first request over each
//! connection: the CodeSets advertisement always, the BiDir listen-point
//! list when the engine offers callback reuse.

use crate::error::{CompletionStatus, OrbError, Result};
use crate::ior::{IiopProfile, Ior};
use crate::marshal::{ValueDecoder, ValueEncoder};
use crate::orb::OrbCore;
use crate::registry::OperationSignature;
use crate::value::Value;
use bytes::Bytes;
use giop::{
    CodeSetsContext, Connection, ConnectionRole, LocateRequestHeader, LocateStatus, Message,
    MessageWriter, ReplyStatus, RequestHeader,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

/// Forward hops followed before a reference is declared unresolvable.
const MAX_FORWARDS: usize = 4;

#[derive(Default)]
enum TokenState {
    #[default]
    Idle,
    Cancelled,
    Armed {
        connection: Connection,
        request_id: u32,
    },
}

/// Cancellation handle onto one in-flight remote call.
///
/// Cloned into whichever task wants to cancel; the proxy arms it once the
/// request id is allocated. Cancelling an armed token resolves the waiting
/// call with [`OrbError::Cancelled`] immediately and sends a best-effort
/// CancelRequest. Cancelling before the call is armed makes the call fail
/// before its frame is ever sent.
#[derive(Clone, Default)]
pub struct CallToken {
    state: Arc<Mutex<TokenState>>,
}

impl CallToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request id of the armed call, once known.
    pub fn request_id(&self) -> Option<u32> {
        match &*self.state.lock() {
            TokenState::Armed { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Cancel the call this token is (or will be) bound to.
    pub async fn cancel(&self) -> Result<()> {
        let armed = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, TokenState::Cancelled) {
                TokenState::Armed {
                    connection,
                    request_id,
                } => Some((connection, request_id)),
                _ => None,
            }
        };
        if let Some((connection, request_id)) = armed {
            connection.cancel(request_id).await?;
        }
        Ok(())
    }

    /// Bind the token to an allocated request. Fails with `Cancelled` when
    /// the token was cancelled first, in which case the frame must not be
    /// sent.
    fn arm(&self, connection: &Connection, request_id: u32) -> Result<()> {
        let mut state = self.state.lock();
        if matches!(*state, TokenState::Cancelled) {
            return Err(OrbError::Cancelled(request_id));
        }
        *state = TokenState::Armed {
            connection: connection.clone(),
            request_id,
        };
        Ok(())
    }
}

impl std::fmt::Debug for CallToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.lock() {
            TokenState::Idle => "idle".to_string(),
            TokenState::Cancelled => "cancelled".to_string(),
            TokenState::Armed { request_id, .. } => format!("armed({request_id})"),
        };
        f.debug_tuple("CallToken").field(&state).finish()
    }
}

enum CallOutcome {
    Done(Option<Value>),
    Forward(Ior),
}

enum LocateOutcome {
    Known(bool),
    Forward(Ior),
}

/// Client side of one remote reference.
pub struct Proxy {
    core: Arc<OrbCore>,
    reference: Ior,
}

impl Proxy {
    pub(crate) fn new(core: Arc<OrbCore>, reference: Ior) -> Self {
        Self { core, reference }
    }

    pub fn reference(&self) -> &Ior {
        &self.reference
    }

    /// Invoke and wait for the result (`None` for void operations).
    /// Operations declared oneway are sent without expecting a reply.
    pub async fn invoke(&self, operation: &str, args: &[Value]) -> Result<Option<Value>> {
        self.invoke_inner(operation, args, None, false).await
    }

    /// Like [`invoke`](Self::invoke), with a token another task may use to
    /// cancel the call while it is in flight.
    pub async fn invoke_cancellable(
        &self,
        operation: &str,
        args: &[Value],
        token: &CallToken,
    ) -> Result<Option<Value>> {
        self.invoke_inner(operation, args, Some(token), false).await
    }

    /// Fire without expecting a reply, whatever the declaration says.
    /// Returns once the frame is on the wire.
    pub async fn oneway(&self, operation: &str, args: &[Value]) -> Result<()> {
        self.invoke_inner(operation, args, None, true).await?;
        Ok(())
    }

    /// Ask the target whether the reference names an active object.
    pub async fn locate(&self) -> Result<bool> {
        let mut forwarded: Option<Ior> = None;
        for _ in 0..=MAX_FORWARDS {
            let reference = forwarded.as_ref().unwrap_or(&self.reference);
            match self.locate_once(reference).await? {
                LocateOutcome::Known(here) => return Ok(here),
                LocateOutcome::Forward(target) => forwarded = Some(target),
            }
        }
        Err(OrbError::UnresolvableReference(format!(
            "locate forwarded more than {MAX_FORWARDS} times"
        )))
    }

    async fn invoke_inner(
        &self,
        operation: &str,
        args: &[Value],
        token: Option<&CallToken>,
        force_oneway: bool,
    ) -> Result<Option<Value>> {
        let mut forwarded: Option<Ior> = None;
        for _ in 0..=MAX_FORWARDS {
            let reference = forwarded.as_ref().unwrap_or(&self.reference);
            match self
                .call_once(reference, operation, args, token, force_oneway)
                .await?
            {
                CallOutcome::Done(result) => return Ok(result),
                CallOutcome::Forward(target) => {
                    debug!("call to {} forwarded to a new profile list", operation);
                    forwarded = Some(target);
                }
            }
        }
        Err(OrbError::UnresolvableReference(format!(
            "{operation}: forwarded more than {MAX_FORWARDS} times"
        )))
    }

    async fn call_once(
        &self,
        reference: &Ior,
        operation: &str,
        args: &[Value],
        token: Option<&CallToken>,
        force_oneway: bool,
    ) -> Result<CallOutcome> {
        let interface = self
            .core
            .registry
            .interface(&reference.type_id)
            .ok_or_else(|| OrbError::UnknownType(reference.type_id.clone()))?;
        let signature = interface.find_operation(operation).ok_or_else(|| {
            OrbError::BadOperation(format!(
                "{} has no operation {:?}",
                reference.type_id, operation
            ))
        })?;
        if signature.params.len() != args.len() {
            return Err(OrbError::BadOperation(format!(
                "{operation} takes {} argument(s), got {}",
                signature.params.len(),
                args.len()
            )));
        }

        let (conn, profile) = self.connect_any(reference).await?;
        let oneway = force_oneway || signature.oneway;

        let request_id = conn.next_request_id();
        let mut header = RequestHeader::new(request_id, profile.object_key.clone(), operation);
        if oneway {
            header = header.oneway();
        }
        self.attach_contexts(&conn, &mut header);

        let mut mw = MessageWriter::request(&header, self.core.config.little_endian);
        let mut encoder = ValueEncoder::new(&self.core.registry);
        for (ty, value) in signature.params.iter().zip(args) {
            encoder.encode(mw.body(), ty, value)?;
        }
        let frame = mw.finish();

        if oneway {
            trace!(
                "oneway request {} ({}) to {}",
                request_id,
                operation,
                conn.peer()
            );
            conn.send_frame(frame).await?;
            return Ok(CallOutcome::Done(None));
        }

        if let Some(token) = token {
            token.arm(&conn, request_id)?;
        }
        trace!("request {} ({}) to {}", request_id, operation, conn.peer());
        let reply = conn.invoke_frame(request_id, frame).await?;
        self.decode_reply(reply, signature)
    }

    /// First profile with a usable connection, in listed order.
    async fn connect_any<'a>(
        &self,
        reference: &'a Ior,
    ) -> Result<(Connection, &'a IiopProfile)> {
        let mut last_error = None;
        for profile in reference.iiop_profiles() {
            let endpoint = profile.endpoint();
            match self.core.manager.get_connection(&endpoint).await {
                Ok(conn) => return Ok((conn, profile)),
                Err(err) => {
                    debug!("profile {} unreachable: {}", endpoint, err);
                    last_error = Some(err);
                }
            }
        }
        Err(match last_error {
            Some(err) => OrbError::UnresolvableReference(format!(
                "no reachable profile for {:?} ({err})",
                reference.type_id
            )),
            None => OrbError::UnresolvableReference(format!(
                "reference {:?} carries no internet profile",
                reference.type_id
            )),
        })
    }

    /// Connection-scoped contexts ride on the first request: the CodeSets
    /// advertisement always, the BiDir listen points when the engine
    /// offers callback reuse and this is a connection we dialed.
    fn attach_contexts(&self, conn: &Connection, header: &mut RequestHeader) {
        if conn.claim_codesets() {
            header
                .service_contexts
                .push(CodeSetsContext::native().to_context());
        }
        if conn.role() == ConnectionRole::Originator && !conn.bidir_offered() {
            if let Some(context) = self.core.manager.bidir_context() {
                header.service_contexts.push(context);
                conn.mark_bidir_offered();
            }
        }
    }

    fn decode_reply(&self, frame: Bytes, signature: &OperationSignature) -> Result<CallOutcome> {
        match Message::parse(frame)? {
            Message::Reply { header, mut body } => match header.status {
                ReplyStatus::NoException => {
                    let result = match &signature.result {
                        Some(ty) => {
                            let mut decoder = ValueDecoder::new(&self.core.registry);
                            Some(decoder.decode(&mut body, ty)?)
                        }
                        None => None,
                    };
                    Ok(CallOutcome::Done(result))
                }
                ReplyStatus::UserException => {
                    let repo_id = body.read_string()?;
                    let remaining = body.remaining();
                    let members = body.read_opaque(remaining)?;
                    Err(OrbError::UserException {
                        repo_id,
                        body: members,
                    })
                }
                ReplyStatus::SystemException => {
                    let repo_id = body.read_string()?;
                    let minor = body.read_u32()?;
                    let raw = body.read_u32()?;
                    let completed = CompletionStatus::from_u32(raw).ok_or_else(|| {
                        OrbError::MalformedMessage(format!("completion status {raw}"))
                    })?;
                    Err(OrbError::from_system_exception(repo_id, minor, completed))
                }
                ReplyStatus::LocationForward => {
                    Ok(CallOutcome::Forward(Ior::decode(&mut body)?))
                }
            },
            other => Err(OrbError::MalformedMessage(format!(
                "expected a reply, got {other:?}"
            ))),
        }
    }

    async fn locate_once(&self, reference: &Ior) -> Result<LocateOutcome> {
        let (conn, profile) = self.connect_any(reference).await?;
        let request_id = conn.next_request_id();
        let header = LocateRequestHeader {
            request_id,
            object_key: profile.object_key.clone(),
        };
        let frame =
            MessageWriter::locate_request(&header, self.core.config.little_endian).finish();
        let reply = conn.invoke_frame(request_id, frame).await?;
        match Message::parse(reply)? {
            Message::LocateReply { header, mut body } => match header.status {
                LocateStatus::ObjectHere => Ok(LocateOutcome::Known(true)),
                LocateStatus::UnknownObject => Ok(LocateOutcome::Known(false)),
                LocateStatus::ObjectForward => {
                    Ok(LocateOutcome::Forward(Ior::decode(&mut body)?))
                }
            },
            other => Err(OrbError::MalformedMessage(format!(
                "expected a locate reply, got {other:?}"
            ))),
        }
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("type_id", &self.reference.type_id)
            .field("profiles", &self.reference.profiles.len())
            .finish()
    }
}
