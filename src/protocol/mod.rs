//! Hot Rod binary protocol: constants, header model and the codec contract
pub mod codec;
pub mod wire;

pub use codec::{codec_for_version, HotRodCodec};
pub use wire::Reader;

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::time::Duration;

use crate::core::{ClientIntelligence, ServerAddress};
use crate::error::DecodeError;
use crate::event::{ClientEvent, CounterEvent};

pub const REQUEST_MAGIC: u8 = 0xA0;
pub const RESPONSE_MAGIC: u8 = 0xA1;

pub const VERSION_28: u8 = 28;
pub const VERSION_30: u8 = 30;
pub const VERSION_31: u8 = 31;
pub const DEFAULT_PROTOCOL_VERSION: u8 = VERSION_31;

// Request / response op codes
pub const PUT_REQUEST: u8 = 0x01;
pub const PUT_RESPONSE: u8 = 0x02;
pub const GET_REQUEST: u8 = 0x03;
pub const GET_RESPONSE: u8 = 0x04;
pub const PUT_IF_ABSENT_REQUEST: u8 = 0x05;
pub const PUT_IF_ABSENT_RESPONSE: u8 = 0x06;
pub const REPLACE_REQUEST: u8 = 0x07;
pub const REPLACE_RESPONSE: u8 = 0x08;
pub const REMOVE_REQUEST: u8 = 0x0B;
pub const REMOVE_RESPONSE: u8 = 0x0C;
pub const CONTAINS_KEY_REQUEST: u8 = 0x0F;
pub const CONTAINS_KEY_RESPONSE: u8 = 0x10;
pub const CLEAR_REQUEST: u8 = 0x13;
pub const CLEAR_RESPONSE: u8 = 0x14;
pub const PING_REQUEST: u8 = 0x17;
pub const PING_RESPONSE: u8 = 0x18;
pub const ERROR_RESPONSE: u8 = 0x50;
pub const ADD_CLIENT_LISTENER_REQUEST: u8 = 0x25;
pub const ADD_CLIENT_LISTENER_RESPONSE: u8 = 0x26;
pub const REMOVE_CLIENT_LISTENER_REQUEST: u8 = 0x27;
pub const REMOVE_CLIENT_LISTENER_RESPONSE: u8 = 0x28;
pub const SIZE_REQUEST: u8 = 0x29;
pub const SIZE_RESPONSE: u8 = 0x2A;

// Server-initiated events
pub const CACHE_ENTRY_CREATED_EVENT: u8 = 0x60;
pub const CACHE_ENTRY_MODIFIED_EVENT: u8 = 0x61;
pub const CACHE_ENTRY_REMOVED_EVENT: u8 = 0x62;
pub const CACHE_ENTRY_EXPIRED_EVENT: u8 = 0x63;
pub const COUNTER_EVENT_RESPONSE: u8 = 0x66;

// Response status codes
pub const NO_ERROR_STATUS: u8 = 0x00;
pub const NOT_PUT_REMOVED_REPLACED_STATUS: u8 = 0x01;
pub const KEY_DOES_NOT_EXIST_STATUS: u8 = 0x02;
pub const SUCCESS_WITH_PREVIOUS: u8 = 0x03;
pub const NOT_EXECUTED_WITH_PREVIOUS: u8 = 0x04;
pub const INVALID_MAGIC_OR_MESSAGE_ID_STATUS: u8 = 0x81;
pub const UNKNOWN_COMMAND_STATUS: u8 = 0x82;
pub const UNKNOWN_VERSION_STATUS: u8 = 0x83;
pub const REQUEST_PARSING_ERROR_STATUS: u8 = 0x84;
pub const SERVER_ERROR_STATUS: u8 = 0x85;
pub const COMMAND_TIMEOUT_STATUS: u8 = 0x86;
pub const NODE_SUSPECTED: u8 = 0x87;
pub const ILLEGAL_LIFECYCLE_STATE: u8 = 0x88;

// Request flags
pub const FORCE_RETURN_VALUE: u32 = 0x0001;

pub const DEFAULT_CACHE_NAME: &str = "";

/// Topology id sent before anything is known about a cache
pub const DEFAULT_CACHE_TOPOLOGY: i32 = -1;
/// Topology id of every cache right after a cluster switch
pub const SWITCH_CLUSTER_TOPOLOGY: i32 = -2;

pub fn is_cache_event(op_code: u8) -> bool {
    (CACHE_ENTRY_CREATED_EVENT..=CACHE_ENTRY_EXPIRED_EVENT).contains(&op_code)
}

pub fn has_previous_value(status: u8) -> bool {
    status == SUCCESS_WITH_PREVIOUS || status == NOT_EXECUTED_WITH_PREVIOUS
}

pub fn is_success(status: u8) -> bool {
    status == NO_ERROR_STATUS || status == SUCCESS_WITH_PREVIOUS
}

/// Fields written in front of every request
#[derive(Debug, Clone)]
pub struct RequestHeader<'a> {
    pub message_id: u64,
    pub op_code: u8,
    pub cache_name: &'a str,
    pub flags: u32,
    pub intelligence: ClientIntelligence,
    pub topology_id: i32,
}

/// What the decoder knows when it reads a response header
#[derive(Debug, Clone, Copy)]
pub struct HeaderContext {
    pub message_id: u64,
    pub received_op_code: u8,
    pub expected_op_code: u8,
    pub intelligence: ClientIntelligence,
}

/// Server-pushed topology carried in a response header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyUpdate {
    pub topology_id: i32,
    pub servers: Vec<ServerAddress>,
    /// -1 when no hash information was sent, 0 when hashing is disabled
    pub hash_function_version: i16,
    pub segment_owners: Vec<Vec<ServerAddress>>,
}

/// Decoded response header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    pub status: u8,
    pub topology: Option<TopologyUpdate>,
    /// Message of an error response
    pub error: Option<String>,
}

/// Encodes requests and decodes responses for one protocol version.
///
/// A connection can swap its codec after protocol negotiation, so
/// implementations must be stateless.
pub trait Codec: Send + Sync + fmt::Debug {
    fn version(&self) -> u8;

    fn write_header(&self, buf: &mut BytesMut, header: &RequestHeader<'_>);

    fn write_expiration(&self, buf: &mut BytesMut, lifespan: Option<Duration>, max_idle: Option<Duration>);

    /// Magic byte plus message id
    fn read_message_id(&self, reader: &mut Reader<'_>) -> Result<u64, DecodeError>;

    fn read_op_code(&self, reader: &mut Reader<'_>) -> Result<u8, DecodeError>;

    /// Status, optional topology and, for error responses, the server message
    fn read_header(&self, reader: &mut Reader<'_>, ctx: &HeaderContext) -> Result<ResponseHeader, DecodeError>;

    /// Listener id and event for an entry event
    fn read_cache_event(&self, reader: &mut Reader<'_>, op_code: u8) -> Result<(Bytes, ClientEvent), DecodeError>;

    fn read_counter_event(&self, reader: &mut Reader<'_>) -> Result<CounterEvent, DecodeError>;

    /// Whether events carry the message id of the listener registration
    fn echoes_event_message_id(&self) -> bool;
}

/// Parse "3.1" style version strings
pub fn parse_protocol_version(version: &str) -> Option<u8> {
    match version.trim() {
        "2.8" => Some(VERSION_28),
        "3.0" => Some(VERSION_30),
        "3.1" => Some(VERSION_31),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_protocol_version() {
        assert_eq!(parse_protocol_version("3.1"), Some(VERSION_31));
        assert_eq!(parse_protocol_version(" 2.8 "), Some(VERSION_28));
        assert_eq!(parse_protocol_version("1.0"), None);
    }

    #[test]
    fn test_status_helpers() {
        assert!(is_success(NO_ERROR_STATUS));
        assert!(is_success(SUCCESS_WITH_PREVIOUS));
        assert!(!is_success(NOT_EXECUTED_WITH_PREVIOUS));
        assert!(has_previous_value(NOT_EXECUTED_WITH_PREVIOUS));
        assert!(!has_previous_value(KEY_DOES_NOT_EXIST_STATUS));
        assert!(is_cache_event(CACHE_ENTRY_EXPIRED_EVENT));
        assert!(!is_cache_event(COUNTER_EVENT_RESPONSE));
    }
}
