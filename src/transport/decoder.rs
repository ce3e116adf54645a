//! Response and event decoding for one connection
//!
//! Decoding runs as an explicit state machine over the connection's read
//! buffer. Each state reads from a fresh cursor positioned at the last
//! checkpoint; bytes are only consumed once the state finished reading, so a
//! partial message leaves the buffer and all side effects untouched and the
//! same state runs again after the next socket read.

use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::core::{ClientIntelligence, ServerAddress};
use crate::error::{DecodeError, HotRodError};
use crate::event::{ClientEvent, CounterEvent};
use crate::operations::{ListenerEffect, QueuedOperation};
use crate::protocol::{
    is_cache_event, Codec, HeaderContext, Reader, TopologyUpdate, COUNTER_EVENT_RESPONSE, NO_ERROR_STATUS,
};

/// An operation registered under a message id
#[derive(Debug, Clone)]
pub(crate) struct Registration {
    pub operation: QueuedOperation,
    /// Intelligence the request was sent with; decides the topology format
    pub intelligence: ClientIntelligence,
}

/// Everything the decoder needs from its connection
pub(crate) trait DecoderSink {
    fn address(&self) -> &ServerAddress;

    fn codec(&self) -> Arc<dyn Codec>;

    fn registration(&self, message_id: u64) -> Option<Registration>;

    /// Drop a registration whose response was fully handled
    fn unregister(&self, message_id: u64) -> Option<Registration>;

    /// Message id of the listener registration in flight, for servers that
    /// do not echo it on events
    fn pending_listener_registration(&self) -> Option<u64>;

    fn apply_listener_effect(&self, effect: ListenerEffect);

    fn topology(&self, cache_name: &str, operation_id: u64, update: &TopologyUpdate);

    fn cache_event(&self, listener_id: &[u8], event: ClientEvent);

    fn counter_event(&self, event: CounterEvent);
}

#[derive(Debug, Clone)]
enum State {
    ReadMessageId,
    ReadHeader {
        message_id: u64,
        op_code: u8,
        registration: Registration,
    },
    ReadPayload {
        message_id: u64,
        status: u8,
        registration: Registration,
    },
    ReadCacheEvent {
        op_code: u8,
        /// Listener of the registration the event's message id resolved to
        expected_listener: Option<Bytes>,
    },
    ReadCounterEvent,
}

#[derive(Debug)]
pub(crate) struct HeaderDecoder {
    state: State,
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderDecoder {
    pub fn new() -> Self {
        Self {
            state: State::ReadMessageId,
        }
    }

    /// True between messages
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::ReadMessageId)
    }

    /// Decode as much of `buf` as possible.
    ///
    /// Returns `Ok` when more bytes are needed; an error is fatal for the
    /// connection.
    pub fn decode(&mut self, buf: &mut BytesMut, sink: &dyn DecoderSink) -> Result<(), HotRodError> {
        loop {
            if buf.is_empty() && self.is_idle() {
                return Ok(());
            }

            let outcome = {
                let mut reader = Reader::new(&buf[..]);
                Self::step(&self.state, &mut reader, sink).map(|next| (next, reader.position()))
            };

            match outcome {
                Ok((next, consumed)) => {
                    buf.advance(consumed);
                    self.state = next;
                }
                Err(HotRodError::Decode(DecodeError::Incomplete)) => {
                    trace!(address = %sink.address(), buffered = buf.len(), "Waiting for more bytes");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn step(state: &State, reader: &mut Reader<'_>, sink: &dyn DecoderSink) -> Result<State, HotRodError> {
        let codec = sink.codec();
        match state {
            State::ReadMessageId => {
                let message_id = codec.read_message_id(reader)?;
                let op_code = codec.read_op_code(reader)?;

                if is_cache_event(op_code) || op_code == COUNTER_EVENT_RESPONSE {
                    let listener_op = if message_id != 0 {
                        sink.registration(message_id)
                    } else if !codec.echoes_event_message_id() {
                        sink.pending_listener_registration()
                            .and_then(|id| sink.registration(id))
                    } else {
                        None
                    };
                    // The registration may already be complete when queued events arrive
                    trace!(
                        address = %sink.address(),
                        message_id,
                        op_code,
                        listener_operation = ?listener_op.as_ref().map(|r| r.operation.op.id()),
                        "Received event"
                    );
                    // Without an echoed id the pending registration may belong to another listener
                    let expected_listener = listener_op
                        .filter(|_| message_id != 0)
                        .and_then(|r| match r.operation.op.listener_effect() {
                            Some(ListenerEffect::Add(listener_id)) => Some(listener_id),
                            _ => None,
                        });
                    return Ok(if op_code == COUNTER_EVENT_RESPONSE {
                        State::ReadCounterEvent
                    } else {
                        State::ReadCacheEvent {
                            op_code,
                            expected_listener,
                        }
                    });
                }

                let registration = sink.registration(message_id).ok_or_else(|| HotRodError::UnknownMessageId {
                    address: sink.address().clone(),
                    message_id,
                })?;
                Ok(State::ReadHeader {
                    message_id,
                    op_code,
                    registration,
                })
            }

            State::ReadHeader {
                message_id,
                op_code,
                registration,
            } => {
                let operation = &registration.operation;
                let ctx = HeaderContext {
                    message_id: *message_id,
                    received_op_code: *op_code,
                    expected_op_code: operation.op.response_op_code(),
                    intelligence: registration.intelligence,
                };
                let header = codec.read_header(reader, &ctx)?;

                if let Some(update) = &header.topology {
                    sink.topology(operation.op.cache_name(), operation.op.id(), update);
                }

                if let Some(message) = header.error {
                    debug!(
                        address = %sink.address(),
                        message_id = *message_id,
                        status = header.status,
                        error = %message,
                        "Server reported an error"
                    );
                    sink.unregister(*message_id);
                    operation.fail(
                        HotRodError::Server {
                            status: header.status,
                            message_id: *message_id,
                            message,
                        },
                        Some(sink.address()),
                    );
                    return Ok(State::ReadMessageId);
                }

                Ok(State::ReadPayload {
                    message_id: *message_id,
                    status: header.status,
                    registration: registration.clone(),
                })
            }

            State::ReadPayload {
                message_id,
                status,
                registration,
            } => {
                let operation = &registration.operation;
                operation
                    .op
                    .complete_from(operation.attempt, codec.as_ref(), *status, reader)?;
                sink.unregister(*message_id);

                match operation.op.listener_effect() {
                    Some(effect @ ListenerEffect::Add(_)) if *status == NO_ERROR_STATUS => {
                        sink.apply_listener_effect(effect)
                    }
                    Some(effect @ ListenerEffect::Remove(_)) => sink.apply_listener_effect(effect),
                    _ => {}
                }
                Ok(State::ReadMessageId)
            }

            State::ReadCacheEvent {
                op_code,
                expected_listener,
            } => {
                let (listener_id, event): (Bytes, ClientEvent) = codec.read_cache_event(reader, *op_code)?;
                match expected_listener {
                    Some(expected) if *expected != listener_id => warn!(
                        address = %sink.address(),
                        expected = %hex::encode(expected),
                        received = %hex::encode(&listener_id),
                        "Dropping event for a listener other than the registering one"
                    ),
                    _ => sink.cache_event(&listener_id, event),
                }
                Ok(State::ReadMessageId)
            }

            State::ReadCounterEvent => {
                let event = codec.read_counter_event(reader)?;
                sink.counter_event(event);
                Ok(State::ReadMessageId)
            }
        }
    }
}
