//! Operations and their in-flight bookkeeping
//!
//! An [`Operation`] only knows how to encode its request and decode its
//! response payload. [`PendingOperation`] wraps it with the state the
//! dispatcher needs across retries: attempt number, retry count, the servers
//! already tried and the completion slot of the current attempt.
pub mod cache;
pub mod listener;

pub use cache::{
    ClearOperation, ConditionalOutcome, ContainsKeyOperation, GetOperation, PingOperation, PingResponse,
    PutIfAbsentOperation, PutOperation, RemoveOperation, ReplaceOperation, SizeOperation,
};
pub use listener::{AddClientListenerOperation, FactoryReference, RemoveClientListenerOperation};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::trace;

use crate::core::ServerAddress;
use crate::error::{DecodeError, HotRodError};
use crate::protocol::{Codec, Reader, RequestHeader};
use crate::topology::ClientTopology;
use crate::transport::connection::WireConnection;

/// A single request/response exchange
pub trait Operation: Send + Sync + 'static {
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    fn request_op_code(&self) -> u8;

    fn response_op_code(&self) -> u8;

    fn cache_name(&self) -> &str;

    fn flags(&self) -> u32 {
        0
    }

    /// Key used for consistent-hash routing
    fn routing_key(&self) -> Option<&[u8]> {
        None
    }

    fn supports_retry(&self) -> bool {
        true
    }

    /// Listener bookkeeping applied to the connection once the response arrives
    fn listener_effect(&self) -> Option<ListenerEffect> {
        None
    }

    fn write_payload(&self, codec: &dyn Codec, buf: &mut BytesMut);

    /// Decode the payload for `status`. Must not have side effects: on
    /// `DecodeError::Incomplete` it is called again once more bytes arrive.
    fn read_payload(&self, codec: &dyn Codec, status: u8, reader: &mut Reader<'_>) -> Result<Self::Output, DecodeError>;
}

/// Listener registration carried by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEffect {
    Add(Bytes),
    Remove(Bytes),
}

/// Why an attempt did not produce a value
#[derive(Debug, Clone)]
pub(crate) struct AttemptFailure {
    pub error: HotRodError,
    /// Server the attempt failed on, if known
    pub address: Option<ServerAddress>,
    /// Re-dispatch without consuming a retry (channel went away before sending)
    pub resubmit: bool,
}

pub(crate) type AttemptResult<T> = Result<T, AttemptFailure>;

/// Object-safe view of a pending operation used by the transport layer
pub(crate) trait ErasedOperation: Send + Sync + fmt::Debug {
    fn id(&self) -> u64;

    fn name(&self) -> &'static str;

    fn cache_name(&self) -> &str;

    fn response_op_code(&self) -> u8;

    fn listener_effect(&self) -> Option<ListenerEffect>;

    fn current_attempt(&self) -> u32;

    /// Header plus payload
    fn encode(&self, codec: &dyn Codec, message_id: u64, topology: ClientTopology, buf: &mut BytesMut);

    /// Decode the payload and complete `attempt` if it is still current
    fn complete_from(&self, attempt: u32, codec: &dyn Codec, status: u8, reader: &mut Reader<'_>) -> Result<(), DecodeError>;

    fn fail(&self, attempt: u32, failure: AttemptFailure);

    /// Remember where `attempt` was written; false if it was already abandoned
    fn written(&self, attempt: u32, connection: &Arc<WireConnection>, message_id: u64) -> bool;
}

#[derive(Debug, Default)]
struct RetryState {
    retries: u32,
    failed_servers: HashSet<ServerAddress>,
}

/// Connection and message id one attempt went out under
struct Carrier {
    attempt: u32,
    connection: Weak<WireConnection>,
    message_id: u64,
}

/// An operation together with its retry bookkeeping
pub(crate) struct PendingOperation<O: Operation> {
    id: u64,
    op: O,
    attempt: AtomicU32,
    completion: Mutex<Option<oneshot::Sender<AttemptResult<O::Output>>>>,
    retry: Mutex<RetryState>,
    carrier: Mutex<Option<Carrier>>,
}

impl<O: Operation> PendingOperation<O> {
    pub fn new(id: u64, op: O) -> Arc<Self> {
        Arc::new(Self {
            id,
            op,
            attempt: AtomicU32::new(0),
            completion: Mutex::new(None),
            retry: Mutex::new(RetryState::default()),
            carrier: Mutex::new(None),
        })
    }

    pub fn operation(&self) -> &O {
        &self.op
    }

    /// Start a new attempt; responses for earlier attempts are discarded
    pub fn begin_attempt(&self) -> (u32, oneshot::Receiver<AttemptResult<O::Output>>) {
        let (tx, rx) = oneshot::channel();
        let mut completion = self.completion.lock();
        let attempt = self.attempt.fetch_add(1, Ordering::AcqRel) + 1;
        *completion = Some(tx);
        (attempt, rx)
    }

    fn finish(&self, attempt: u32, result: AttemptResult<O::Output>) -> bool {
        let mut completion = self.completion.lock();
        if self.attempt.load(Ordering::Acquire) != attempt {
            return false;
        }
        match completion.take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Count a retry and remember the server that failed; returns the new count
    pub fn record_retry(&self, failed: Option<&ServerAddress>) -> u32 {
        let mut retry = self.retry.lock();
        if let Some(address) = failed {
            retry.failed_servers.insert(address.clone());
        }
        retry.retries += 1;
        retry.retries
    }

    /// Give up on `attempt`. Its registration moves off the connection that
    /// carries it, so the connection no longer counts it as pending; a late
    /// response is still read and dropped.
    pub fn abandon_attempt(&self, attempt: u32) {
        let carrier = {
            let mut carrier = self.carrier.lock();
            let mut completion = self.completion.lock();
            if self
                .attempt
                .compare_exchange(attempt, attempt + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                completion.take();
            }
            carrier.take()
        };
        let Some(carrier) = carrier.filter(|carrier| carrier.attempt == attempt) else {
            return;
        };
        if let Some(connection) = carrier.connection.upgrade() {
            connection.abandon(carrier.message_id);
        }
    }

    pub fn failed_servers(&self) -> HashSet<ServerAddress> {
        self.retry.lock().failed_servers.clone()
    }
}

impl<O: Operation> fmt::Debug for PendingOperation<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("id", &self.id)
            .field("name", &self.op.name())
            .field("cache", &self.op.cache_name())
            .field("attempt", &self.attempt.load(Ordering::Relaxed))
            .finish()
    }
}

impl<O: Operation> ErasedOperation for PendingOperation<O> {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &'static str {
        self.op.name()
    }

    fn cache_name(&self) -> &str {
        self.op.cache_name()
    }

    fn response_op_code(&self) -> u8 {
        self.op.response_op_code()
    }

    fn listener_effect(&self) -> Option<ListenerEffect> {
        self.op.listener_effect()
    }

    fn current_attempt(&self) -> u32 {
        self.attempt.load(Ordering::Acquire)
    }

    fn encode(&self, codec: &dyn Codec, message_id: u64, topology: ClientTopology, buf: &mut BytesMut) {
        codec.write_header(
            buf,
            &RequestHeader {
                message_id,
                op_code: self.op.request_op_code(),
                cache_name: self.op.cache_name(),
                flags: self.op.flags(),
                intelligence: topology.intelligence,
                topology_id: topology.topology_id,
            },
        );
        self.op.write_payload(codec, buf);
    }

    fn complete_from(&self, attempt: u32, codec: &dyn Codec, status: u8, reader: &mut Reader<'_>) -> Result<(), DecodeError> {
        let output = self.op.read_payload(codec, status, reader)?;
        if !self.finish(attempt, Ok(output)) {
            trace!(operation = self.op.name(), id = self.id, attempt, "Discarding response for a superseded attempt");
        }
        Ok(())
    }

    fn fail(&self, attempt: u32, failure: AttemptFailure) {
        self.finish(attempt, Err(failure));
    }

    fn written(&self, attempt: u32, connection: &Arc<WireConnection>, message_id: u64) -> bool {
        let mut carrier = self.carrier.lock();
        if self.attempt.load(Ordering::Acquire) != attempt {
            return false;
        }
        *carrier = Some(Carrier {
            attempt,
            connection: Arc::downgrade(connection),
            message_id,
        });
        true
    }
}

/// An operation queued or registered for one specific attempt
#[derive(Debug, Clone)]
pub(crate) struct QueuedOperation {
    pub op: Arc<dyn ErasedOperation>,
    pub attempt: u32,
}

impl QueuedOperation {
    pub fn new(op: Arc<dyn ErasedOperation>, attempt: u32) -> Self {
        Self { op, attempt }
    }

    /// False once the dispatcher moved on to a later attempt
    pub fn is_current(&self) -> bool {
        self.op.current_attempt() == self.attempt
    }

    pub fn fail(&self, error: HotRodError, address: Option<&ServerAddress>) {
        self.op.fail(
            self.attempt,
            AttemptFailure {
                error,
                address: address.cloned(),
                resubmit: false,
            },
        );
    }

    /// Hand the operation back to the dispatcher without counting a retry
    pub fn resubmit(&self, error: HotRodError) {
        self.op.fail(
            self.attempt,
            AttemptFailure {
                error,
                address: None,
                resubmit: true,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ClientIntelligence;
    use crate::protocol::{codec_for_version, KEY_DOES_NOT_EXIST_STATUS, NO_ERROR_STATUS, VERSION_31};

    fn topology() -> ClientTopology {
        ClientTopology {
            topology_id: 3,
            intelligence: ClientIntelligence::Basic,
        }
    }

    #[tokio::test]
    async fn test_attempt_completes_once() {
        let codec = codec_for_version(VERSION_31).unwrap();
        let pending = PendingOperation::new(1, GetOperation::new("default", "k"));
        let (attempt, rx) = pending.begin_attempt();

        let payload = [0x01, b'v'];
        let mut reader = Reader::new(&payload);
        pending.complete_from(attempt, codec.as_ref(), NO_ERROR_STATUS, &mut reader).unwrap();

        // A late failure for the same attempt is ignored
        pending.fail(
            attempt,
            AttemptFailure {
                error: HotRodError::internal("late"),
                address: None,
                resubmit: false,
            },
        );

        let value = rx.await.unwrap().unwrap();
        assert_eq!(value.as_deref(), Some(&b"v"[..]));
    }

    #[tokio::test]
    async fn test_stale_attempt_is_discarded() {
        let codec = codec_for_version(VERSION_31).unwrap();
        let pending = PendingOperation::new(2, GetOperation::new("default", "k"));
        let (first, _first_rx) = pending.begin_attempt();
        let (second, second_rx) = pending.begin_attempt();
        assert_eq!(second, first + 1);

        // Response to the superseded attempt still consumes its payload
        let payload = [0x01, b'x'];
        let mut reader = Reader::new(&payload);
        pending.complete_from(first, codec.as_ref(), NO_ERROR_STATUS, &mut reader).unwrap();
        assert_eq!(reader.remaining(), 0);

        let mut reader = Reader::new(&[]);
        pending
            .complete_from(second, codec.as_ref(), KEY_DOES_NOT_EXIST_STATUS, &mut reader)
            .unwrap();
        assert_eq!(second_rx.await.unwrap().unwrap(), None);
    }

    #[test]
    fn test_incomplete_payload_has_no_effect() {
        let codec = codec_for_version(VERSION_31).unwrap();
        let pending = PendingOperation::new(3, GetOperation::new("default", "k"));
        let (attempt, mut rx) = pending.begin_attempt();

        let payload = [0x03, b'v'];
        let mut reader = Reader::new(&payload);
        let result = pending.complete_from(attempt, codec.as_ref(), NO_ERROR_STATUS, &mut reader);
        assert_eq!(result, Err(DecodeError::Incomplete));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_retry_bookkeeping() {
        let pending = PendingOperation::new(4, GetOperation::new("default", "k"));
        let a = ServerAddress::new("a", 1);
        let b = ServerAddress::new("b", 1);

        assert_eq!(pending.record_retry(Some(&a)), 1);
        assert_eq!(pending.record_retry(Some(&b)), 2);
        assert_eq!(pending.record_retry(None), 3);
        let failed = pending.failed_servers();
        assert!(failed.contains(&a));
        assert_eq!(failed.len(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_attempt_is_superseded() {
        let codec = codec_for_version(VERSION_31).unwrap();
        let pending = PendingOperation::new(6, GetOperation::new("default", "k"));
        let (attempt, rx) = pending.begin_attempt();

        pending.abandon_attempt(attempt);
        assert_ne!(pending.current_attempt(), attempt);
        assert!(rx.await.is_err());

        // Late payload is still consumed
        let payload = [0x01, b'v'];
        let mut reader = Reader::new(&payload);
        pending.complete_from(attempt, codec.as_ref(), NO_ERROR_STATUS, &mut reader).unwrap();
        assert_eq!(reader.remaining(), 0);

        // A later attempt is unaffected by abandoning an old one
        let (next, next_rx) = pending.begin_attempt();
        pending.abandon_attempt(attempt);
        let mut reader = Reader::new(&[]);
        pending
            .complete_from(next, codec.as_ref(), KEY_DOES_NOT_EXIST_STATUS, &mut reader)
            .unwrap();
        assert_eq!(next_rx.await.unwrap().unwrap(), None);
    }

    #[test]
    fn test_encode_writes_header_and_payload() {
        let codec = codec_for_version(VERSION_31).unwrap();
        let pending = PendingOperation::new(5, GetOperation::new("default", "key"));
        let mut buf = BytesMut::new();
        pending.encode(codec.as_ref(), 9, topology(), &mut buf);

        assert_eq!(buf[0], crate::protocol::REQUEST_MAGIC);
        assert_eq!(buf[1], 9);
        assert_eq!(&buf[buf.len() - 4..], &[3, b'k', b'e', b'y']);
    }
}
