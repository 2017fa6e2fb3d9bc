//! Request dispatch.
//!
//! One dispatcher serves every connection of an engine; the per-connection
//! reader tasks hand it complete inbound Request and LocateRequest
//! messages, callbacks arriving on originated connections included. Per
//! request it resolves the servant through the adapter registry, decodes
//! the arguments against the registered operation signature, executes, and
//! encodes the outcome as a reply. Servant failures never escape: they are
//! captured into system or user exception replies. Oneway requests execute
//! the same way but answer nothing, failure included.

use crate::adapter::AdapterRegistry;
use crate::error::{OrbError, Result};
use crate::marshal::{ValueDecoder, ValueEncoder};
use crate::registry::TypeRegistry;
use async_trait::async_trait;
use bytes::Bytes;
use cdr::CdrReader;
use giop::{
    LocateReplyHeader, LocateRequestHeader, LocateStatus, Message, MessageWriter, ReplyHeader,
    ReplyStatus, RequestHandler, RequestHeader,
};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Serves inbound requests against the local adapters.
pub struct Dispatcher {
    registry: Arc<TypeRegistry>,
    adapters: Arc<AdapterRegistry>,
    /// Byte order of the replies this dispatcher writes.
    little_endian: bool,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<TypeRegistry>,
        adapters: Arc<AdapterRegistry>,
        little_endian: bool,
    ) -> Self {
        Self {
            registry,
            adapters,
            little_endian,
        }
    }

    /// Resolve, decode, execute, and encode the reply frame. `None` for a
    /// oneway request that ran (successfully or not, the caller logs the
    /// latter through the returned error).
    async fn serve_request(
        &self,
        header: &RequestHeader,
        mut body: CdrReader,
    ) -> Result<Option<Bytes>> {
        // The servant must exist before anything is decoded or executed.
        let servant = self
            .adapters
            .resolve(&header.object_key)
            .ok_or_else(|| OrbError::ObjectNotExist(format!("request {}", header.request_id)))?;

        let interface = self
            .registry
            .interface(servant.type_id())
            .ok_or_else(|| OrbError::UnknownType(servant.type_id().to_string()))?;
        let signature = interface.find_operation(&header.operation).ok_or_else(|| {
            OrbError::BadOperation(format!(
                "{} has no operation {:?}",
                servant.type_id(),
                header.operation
            ))
        })?;

        // One decoder per request, so identity is shared across arguments.
        let mut decoder = ValueDecoder::new(&self.registry);
        let mut args = Vec::with_capacity(signature.params.len());
        for param in &signature.params {
            args.push(decoder.decode(&mut body, param)?);
        }
        trace!(
            "request {}: executing {} with {} argument(s)",
            header.request_id,
            header.operation,
            args.len()
        );

        let result = servant.invoke(&header.operation, args).await?;
        if !header.response_expected() {
            return Ok(None);
        }

        let reply = ReplyHeader::new(header.request_id, ReplyStatus::NoException);
        let mut mw = MessageWriter::reply(&reply, self.little_endian);
        match (&signature.result, result) {
            (Some(ty), Some(value)) => {
                let mut encoder = ValueEncoder::new(&self.registry);
                encoder.encode(mw.body(), ty, &value)?;
            }
            (Some(_), None) => {
                return Err(OrbError::MalformedMessage(format!(
                    "operation {} produced no result",
                    header.operation
                )));
            }
            // The signature governs the wire; a value returned by a void
            // operation is dropped.
            (None, _) => {}
        }
        Ok(Some(mw.finish()))
    }

    /// A reply frame carrying `err` as a user or system exception.
    fn exception_reply(&self, request_id: u32, err: &OrbError) -> Bytes {
        match err {
            OrbError::UserException { repo_id, body } => {
                let header = ReplyHeader::new(request_id, ReplyStatus::UserException);
                let mut mw = MessageWriter::reply(&header, self.little_endian);
                mw.body().write_string(repo_id);
                mw.body().write_opaque(body);
                mw.finish()
            }
            other => {
                let (repo_id, minor, completed) = other.to_system_exception();
                let header = ReplyHeader::new(request_id, ReplyStatus::SystemException);
                let mut mw = MessageWriter::reply(&header, self.little_endian);
                mw.body().write_string(repo_id);
                mw.body().write_u32(minor);
                mw.body().write_u32(completed.as_u32());
                mw.finish()
            }
        }
    }

    fn serve_locate(&self, header: &LocateRequestHeader) -> Bytes {
        let status = if self.adapters.resolve(&header.object_key).is_some() {
            LocateStatus::ObjectHere
        } else {
            LocateStatus::UnknownObject
        };
        debug!("locate request {}: {:?}", header.request_id, status);
        let reply = LocateReplyHeader {
            request_id: header.request_id,
            status,
        };
        MessageWriter::locate_reply(&reply, self.little_endian).finish()
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, message: Message) -> Option<Bytes> {
        match message {
            Message::Request { header, body } => {
                let expects_reply = header.response_expected();
                match self.serve_request(&header, body).await {
                    Ok(reply) => reply,
                    Err(err) => {
                        warn!(
                            "request {} ({}) failed: {}",
                            header.request_id, header.operation, err
                        );
                        expects_reply.then(|| self.exception_reply(header.request_id, &err))
                    }
                }
            }
            Message::LocateRequest(header) => Some(self.serve_locate(&header)),
            // The reader task routes every other kind before we see it.
            other => {
                debug!("dispatcher ignoring unexpected {:?}", other);
                None
            }
        }
    }

    async fn cancel(&self, request_id: u32) {
        // Best effort only: execution already under way runs to completion.
        debug!("peer cancelled request {}", request_id);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("little_endian", &self.little_endian)
            .finish()
    }
}
