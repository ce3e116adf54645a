//! Client listener registration

use bytes::{BufMut, Bytes, BytesMut};

use super::{ListenerEffect, Operation};
use crate::error::DecodeError;
use crate::protocol::wire::{write_array, write_string, write_vint};
use crate::protocol::*;

/// Every entry event type
const ALL_EVENT_INTERESTS: u32 = 0x0F;

/// Named server-side factory with its parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactoryReference {
    pub name: String,
    pub params: Vec<Bytes>,
}

impl FactoryReference {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    fn write(reference: Option<&FactoryReference>, buf: &mut BytesMut) {
        match reference {
            Some(reference) if !reference.name.is_empty() => {
                write_string(buf, &reference.name);
                buf.put_u8(reference.params.len() as u8);
                for param in &reference.params {
                    write_array(buf, param);
                }
            }
            _ => write_string(buf, ""),
        }
    }
}

/// Register a listener on the server the request lands on.
///
/// Events for the listener only flow over the connection that carried this
/// request, so the dispatcher pins it to one address per attempt.
#[derive(Debug, Clone)]
pub struct AddClientListenerOperation {
    cache_name: String,
    listener_id: Bytes,
    include_current_state: bool,
    filter_factory: Option<FactoryReference>,
    converter_factory: Option<FactoryReference>,
    use_raw_data: bool,
}

impl AddClientListenerOperation {
    pub fn new<S: Into<String>>(cache_name: S, listener_id: Bytes) -> Self {
        Self {
            cache_name: cache_name.into(),
            listener_id,
            include_current_state: false,
            filter_factory: None,
            converter_factory: None,
            use_raw_data: false,
        }
    }

    pub fn include_current_state(mut self, include: bool) -> Self {
        self.include_current_state = include;
        self
    }

    pub fn filter_factory(mut self, factory: FactoryReference) -> Self {
        self.filter_factory = Some(factory);
        self
    }

    pub fn converter_factory(mut self, factory: FactoryReference) -> Self {
        self.converter_factory = Some(factory);
        self
    }

    pub fn use_raw_data(mut self, raw: bool) -> Self {
        self.use_raw_data = raw;
        self
    }

    pub fn listener_id(&self) -> &Bytes {
        &self.listener_id
    }
}

impl Operation for AddClientListenerOperation {
    type Output = ();

    fn name(&self) -> &'static str {
        "add_client_listener"
    }

    fn request_op_code(&self) -> u8 {
        ADD_CLIENT_LISTENER_REQUEST
    }

    fn response_op_code(&self) -> u8 {
        ADD_CLIENT_LISTENER_RESPONSE
    }

    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    fn listener_effect(&self) -> Option<ListenerEffect> {
        Some(ListenerEffect::Add(self.listener_id.clone()))
    }

    fn write_payload(&self, codec: &dyn Codec, buf: &mut BytesMut) {
        write_array(buf, &self.listener_id);
        buf.put_u8(u8::from(self.include_current_state));
        FactoryReference::write(self.filter_factory.as_ref(), buf);
        FactoryReference::write(self.converter_factory.as_ref(), buf);
        buf.put_u8(u8::from(self.use_raw_data));
        if codec.version() >= VERSION_30 {
            write_vint(buf, ALL_EVENT_INTERESTS);
        }
    }

    fn read_payload(&self, _codec: &dyn Codec, _status: u8, _reader: &mut Reader<'_>) -> Result<(), DecodeError> {
        Ok(())
    }
}

/// Remove a listener; must be sent to the server the listener is pinned to
#[derive(Debug, Clone)]
pub struct RemoveClientListenerOperation {
    cache_name: String,
    listener_id: Bytes,
}

impl RemoveClientListenerOperation {
    pub fn new<S: Into<String>>(cache_name: S, listener_id: Bytes) -> Self {
        Self {
            cache_name: cache_name.into(),
            listener_id,
        }
    }
}

impl Operation for RemoveClientListenerOperation {
    type Output = bool;

    fn name(&self) -> &'static str {
        "remove_client_listener"
    }

    fn request_op_code(&self) -> u8 {
        REMOVE_CLIENT_LISTENER_REQUEST
    }

    fn response_op_code(&self) -> u8 {
        REMOVE_CLIENT_LISTENER_RESPONSE
    }

    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    fn listener_effect(&self) -> Option<ListenerEffect> {
        Some(ListenerEffect::Remove(self.listener_id.clone()))
    }

    fn write_payload(&self, _codec: &dyn Codec, buf: &mut BytesMut) {
        write_array(buf, &self.listener_id);
    }

    fn read_payload(&self, _codec: &dyn Codec, status: u8, _reader: &mut Reader<'_>) -> Result<bool, DecodeError> {
        Ok(status == NO_ERROR_STATUS)
    }
}
