//! Keyed and cache-wide operations

use bytes::{Bytes, BytesMut};
use std::time::Duration;

use super::Operation;
use crate::error::DecodeError;
use crate::protocol::wire::write_array;
use crate::protocol::*;

/// Result of a conditional write or removal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalOutcome {
    /// Whether the server applied the change
    pub executed: bool,
    /// Previous value, when requested and present
    pub previous: Option<Bytes>,
}

fn read_previous(status: u8, reader: &mut Reader<'_>) -> Result<Option<Bytes>, DecodeError> {
    if has_previous_value(status) {
        let previous = reader.read_array()?;
        // An empty previous value means there was none
        Ok(if previous.is_empty() { None } else { Some(previous) })
    } else {
        Ok(None)
    }
}

fn return_flags(return_previous: bool) -> u32 {
    if return_previous {
        FORCE_RETURN_VALUE
    } else {
        0
    }
}

/// Server ping, also used for protocol negotiation and liveness checks
#[derive(Debug, Clone)]
pub struct PingOperation {
    cache_name: String,
}

/// What the server reported about itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingResponse {
    /// Preferred protocol version, 0 when the server does not say
    pub server_version: u8,
    pub supported_operations: Vec<u16>,
}

impl PingOperation {
    pub fn new<S: Into<String>>(cache_name: S) -> Self {
        Self {
            cache_name: cache_name.into(),
        }
    }
}

fn skip_media_type(reader: &mut Reader<'_>) -> Result<(), DecodeError> {
    match reader.read_u8()? {
        0 => return Ok(()),
        1 => {
            reader.read_vint()?;
        }
        2 => {
            reader.read_string()?;
        }
        other => {
            return Err(DecodeError::InvalidResponse(format!(
                "Unknown media type encoding {}",
                other
            )))
        }
    }
    let params = reader.read_vint()?;
    for _ in 0..params {
        reader.read_string()?;
        reader.read_string()?;
    }
    Ok(())
}

impl Operation for PingOperation {
    type Output = PingResponse;

    fn name(&self) -> &'static str {
        "ping"
    }

    fn request_op_code(&self) -> u8 {
        PING_REQUEST
    }

    fn response_op_code(&self) -> u8 {
        PING_RESPONSE
    }

    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    fn write_payload(&self, _codec: &dyn Codec, _buf: &mut BytesMut) {}

    fn read_payload(&self, codec: &dyn Codec, status: u8, reader: &mut Reader<'_>) -> Result<PingResponse, DecodeError> {
        if codec.version() < VERSION_30 || !is_success(status) {
            return Ok(PingResponse::default());
        }
        skip_media_type(reader)?;
        skip_media_type(reader)?;
        let server_version = reader.read_u8()?;
        let count = reader.read_vint()?;
        let mut supported_operations = Vec::with_capacity(count.min(256) as usize);
        for _ in 0..count {
            supported_operations.push(reader.read_u16()?);
        }
        Ok(PingResponse {
            server_version,
            supported_operations,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GetOperation {
    cache_name: String,
    key: Bytes,
}

impl GetOperation {
    pub fn new<S: Into<String>, K: Into<Bytes>>(cache_name: S, key: K) -> Self {
        Self {
            cache_name: cache_name.into(),
            key: key.into(),
        }
    }
}

impl Operation for GetOperation {
    type Output = Option<Bytes>;

    fn name(&self) -> &'static str {
        "get"
    }

    fn request_op_code(&self) -> u8 {
        GET_REQUEST
    }

    fn response_op_code(&self) -> u8 {
        GET_RESPONSE
    }

    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    fn routing_key(&self) -> Option<&[u8]> {
        Some(&self.key)
    }

    fn write_payload(&self, _codec: &dyn Codec, buf: &mut BytesMut) {
        write_array(buf, &self.key);
    }

    fn read_payload(&self, _codec: &dyn Codec, status: u8, reader: &mut Reader<'_>) -> Result<Option<Bytes>, DecodeError> {
        if status == KEY_DOES_NOT_EXIST_STATUS {
            return Ok(None);
        }
        Ok(Some(reader.read_array()?))
    }
}

/// Store a value, optionally returning the one it replaced
#[derive(Debug, Clone)]
pub struct PutOperation {
    cache_name: String,
    key: Bytes,
    value: Bytes,
    lifespan: Option<Duration>,
    max_idle: Option<Duration>,
    return_previous: bool,
}

impl PutOperation {
    pub fn new<S: Into<String>, K: Into<Bytes>, V: Into<Bytes>>(cache_name: S, key: K, value: V) -> Self {
        Self {
            cache_name: cache_name.into(),
            key: key.into(),
            value: value.into(),
            lifespan: None,
            max_idle: None,
            return_previous: false,
        }
    }

    /// `Some(Duration::ZERO)` means never expire; `None` uses the server default
    pub fn with_expiration(mut self, lifespan: Option<Duration>, max_idle: Option<Duration>) -> Self {
        self.lifespan = lifespan;
        self.max_idle = max_idle;
        self
    }

    pub fn return_previous(mut self, return_previous: bool) -> Self {
        self.return_previous = return_previous;
        self
    }
}

impl Operation for PutOperation {
    type Output = Option<Bytes>;

    fn name(&self) -> &'static str {
        "put"
    }

    fn request_op_code(&self) -> u8 {
        PUT_REQUEST
    }

    fn response_op_code(&self) -> u8 {
        PUT_RESPONSE
    }

    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    fn flags(&self) -> u32 {
        return_flags(self.return_previous)
    }

    fn routing_key(&self) -> Option<&[u8]> {
        Some(&self.key)
    }

    fn write_payload(&self, codec: &dyn Codec, buf: &mut BytesMut) {
        write_array(buf, &self.key);
        codec.write_expiration(buf, self.lifespan, self.max_idle);
        write_array(buf, &self.value);
    }

    fn read_payload(&self, _codec: &dyn Codec, status: u8, reader: &mut Reader<'_>) -> Result<Option<Bytes>, DecodeError> {
        read_previous(status, reader)
    }
}

/// Store a value only if the key is absent
#[derive(Debug, Clone)]
pub struct PutIfAbsentOperation {
    inner: PutOperation,
}

impl PutIfAbsentOperation {
    pub fn new<S: Into<String>, K: Into<Bytes>, V: Into<Bytes>>(cache_name: S, key: K, value: V) -> Self {
        Self {
            inner: PutOperation::new(cache_name, key, value),
        }
    }

    pub fn with_expiration(mut self, lifespan: Option<Duration>, max_idle: Option<Duration>) -> Self {
        self.inner = self.inner.with_expiration(lifespan, max_idle);
        self
    }

    pub fn return_previous(mut self, return_previous: bool) -> Self {
        self.inner = self.inner.return_previous(return_previous);
        self
    }
}

impl Operation for PutIfAbsentOperation {
    type Output = ConditionalOutcome;

    fn name(&self) -> &'static str {
        "put_if_absent"
    }

    fn request_op_code(&self) -> u8 {
        PUT_IF_ABSENT_REQUEST
    }

    fn response_op_code(&self) -> u8 {
        PUT_IF_ABSENT_RESPONSE
    }

    fn cache_name(&self) -> &str {
        self.inner.cache_name()
    }

    fn flags(&self) -> u32 {
        self.inner.flags()
    }

    fn routing_key(&self) -> Option<&[u8]> {
        self.inner.routing_key()
    }

    fn write_payload(&self, codec: &dyn Codec, buf: &mut BytesMut) {
        self.inner.write_payload(codec, buf);
    }

    fn read_payload(&self, _codec: &dyn Codec, status: u8, reader: &mut Reader<'_>) -> Result<ConditionalOutcome, DecodeError> {
        Ok(ConditionalOutcome {
            executed: is_success(status),
            previous: read_previous(status, reader)?,
        })
    }
}

/// Replace the value of an existing key
#[derive(Debug, Clone)]
pub struct ReplaceOperation {
    inner: PutOperation,
}

impl ReplaceOperation {
    pub fn new<S: Into<String>, K: Into<Bytes>, V: Into<Bytes>>(cache_name: S, key: K, value: V) -> Self {
        Self {
            inner: PutOperation::new(cache_name, key, value),
        }
    }

    pub fn with_expiration(mut self, lifespan: Option<Duration>, max_idle: Option<Duration>) -> Self {
        self.inner = self.inner.with_expiration(lifespan, max_idle);
        self
    }

    pub fn return_previous(mut self, return_previous: bool) -> Self {
        self.inner = self.inner.return_previous(return_previous);
        self
    }
}

impl Operation for ReplaceOperation {
    type Output = ConditionalOutcome;

    fn name(&self) -> &'static str {
        "replace"
    }

    fn request_op_code(&self) -> u8 {
        REPLACE_REQUEST
    }

    fn response_op_code(&self) -> u8 {
        REPLACE_RESPONSE
    }

    fn cache_name(&self) -> &str {
        self.inner.cache_name()
    }

    fn flags(&self) -> u32 {
        self.inner.flags()
    }

    fn routing_key(&self) -> Option<&[u8]> {
        self.inner.routing_key()
    }

    fn write_payload(&self, codec: &dyn Codec, buf: &mut BytesMut) {
        self.inner.write_payload(codec, buf);
    }

    fn read_payload(&self, _codec: &dyn Codec, status: u8, reader: &mut Reader<'_>) -> Result<ConditionalOutcome, DecodeError> {
        Ok(ConditionalOutcome {
            executed: is_success(status),
            previous: read_previous(status, reader)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RemoveOperation {
    cache_name: String,
    key: Bytes,
    return_previous: bool,
}

impl RemoveOperation {
    pub fn new<S: Into<String>, K: Into<Bytes>>(cache_name: S, key: K) -> Self {
        Self {
            cache_name: cache_name.into(),
            key: key.into(),
            return_previous: false,
        }
    }

    pub fn return_previous(mut self, return_previous: bool) -> Self {
        self.return_previous = return_previous;
        self
    }
}

impl Operation for RemoveOperation {
    type Output = ConditionalOutcome;

    fn name(&self) -> &'static str {
        "remove"
    }

    fn request_op_code(&self) -> u8 {
        REMOVE_REQUEST
    }

    fn response_op_code(&self) -> u8 {
        REMOVE_RESPONSE
    }

    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    fn flags(&self) -> u32 {
        return_flags(self.return_previous)
    }

    fn routing_key(&self) -> Option<&[u8]> {
        Some(&self.key)
    }

    fn write_payload(&self, _codec: &dyn Codec, buf: &mut BytesMut) {
        write_array(buf, &self.key);
    }

    fn read_payload(&self, _codec: &dyn Codec, status: u8, reader: &mut Reader<'_>) -> Result<ConditionalOutcome, DecodeError> {
        Ok(ConditionalOutcome {
            executed: is_success(status),
            previous: read_previous(status, reader)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ContainsKeyOperation {
    cache_name: String,
    key: Bytes,
}

impl ContainsKeyOperation {
    pub fn new<S: Into<String>, K: Into<Bytes>>(cache_name: S, key: K) -> Self {
        Self {
            cache_name: cache_name.into(),
            key: key.into(),
        }
    }
}

impl Operation for ContainsKeyOperation {
    type Output = bool;

    fn name(&self) -> &'static str {
        "contains_key"
    }

    fn request_op_code(&self) -> u8 {
        CONTAINS_KEY_REQUEST
    }

    fn response_op_code(&self) -> u8 {
        CONTAINS_KEY_RESPONSE
    }

    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    fn routing_key(&self) -> Option<&[u8]> {
        Some(&self.key)
    }

    fn write_payload(&self, _codec: &dyn Codec, buf: &mut BytesMut) {
        write_array(buf, &self.key);
    }

    fn read_payload(&self, _codec: &dyn Codec, status: u8, _reader: &mut Reader<'_>) -> Result<bool, DecodeError> {
        Ok(status == NO_ERROR_STATUS)
    }
}

#[derive(Debug, Clone)]
pub struct ClearOperation {
    cache_name: String,
}

impl ClearOperation {
    pub fn new<S: Into<String>>(cache_name: S) -> Self {
        Self {
            cache_name: cache_name.into(),
        }
    }
}

impl Operation for ClearOperation {
    type Output = ();

    fn name(&self) -> &'static str {
        "clear"
    }

    fn request_op_code(&self) -> u8 {
        CLEAR_REQUEST
    }

    fn response_op_code(&self) -> u8 {
        CLEAR_RESPONSE
    }

    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    fn write_payload(&self, _codec: &dyn Codec, _buf: &mut BytesMut) {}

    fn read_payload(&self, _codec: &dyn Codec, _status: u8, _reader: &mut Reader<'_>) -> Result<(), DecodeError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SizeOperation {
    cache_name: String,
}

impl SizeOperation {
    pub fn new<S: Into<String>>(cache_name: S) -> Self {
        Self {
            cache_name: cache_name.into(),
        }
    }
}

impl Operation for SizeOperation {
    type Output = u64;

    fn name(&self) -> &'static str {
        "size"
    }

    fn request_op_code(&self) -> u8 {
        SIZE_REQUEST
    }

    fn response_op_code(&self) -> u8 {
        SIZE_RESPONSE
    }

    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    fn write_payload(&self, _codec: &dyn Codec, _buf: &mut BytesMut) {}

    fn read_payload(&self, _codec: &dyn Codec, _status: u8, reader: &mut Reader<'_>) -> Result<u64, DecodeError> {
        reader.read_vlong()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::{write_string, write_vint};
    use bytes::BufMut;

    fn codec() -> std::sync::Arc<dyn Codec> {
        codec_for_version(VERSION_31).unwrap()
    }

    #[test]
    fn test_put_payload() {
        let op = PutOperation::new("default", "k", "value").with_expiration(Some(Duration::from_secs(2)), None);
        let mut buf = BytesMut::new();
        op.write_payload(codec().as_ref(), &mut buf);

        let mut reader = Reader::new(&buf);
        assert_eq!(&reader.read_array().unwrap()[..], b"k");
        assert_eq!(reader.read_u8().unwrap(), 0x17);
        assert_eq!(reader.read_vlong().unwrap(), 2000);
        assert_eq!(&reader.read_array().unwrap()[..], b"value");
        assert_eq!(op.flags(), 0);
        assert_eq!(op.return_previous(true).flags(), FORCE_RETURN_VALUE);
    }

    #[test]
    fn test_put_previous_value() {
        let op = PutOperation::new("default", "k", "v").return_previous(true);
        let payload = [0x03, b'o', b'l', b'd'];
        let mut reader = Reader::new(&payload);
        let previous = op.read_payload(codec().as_ref(), SUCCESS_WITH_PREVIOUS, &mut reader).unwrap();
        assert_eq!(previous.as_deref(), Some(&b"old"[..]));

        let mut reader = Reader::new(&[]);
        assert_eq!(op.read_payload(codec().as_ref(), NO_ERROR_STATUS, &mut reader).unwrap(), None);
    }

    #[test]
    fn test_put_if_absent_outcome() {
        let op = PutIfAbsentOperation::new("default", "k", "v").return_previous(true);
        let payload = [0x01, b'x'];
        let mut reader = Reader::new(&payload);
        let outcome = op.read_payload(codec().as_ref(), NOT_EXECUTED_WITH_PREVIOUS, &mut reader).unwrap();
        assert!(!outcome.executed);
        assert_eq!(outcome.previous.as_deref(), Some(&b"x"[..]));

        let mut reader = Reader::new(&[]);
        let outcome = op.read_payload(codec().as_ref(), NO_ERROR_STATUS, &mut reader).unwrap();
        assert!(outcome.executed);
    }

    #[test]
    fn test_remove_and_contains() {
        let remove = RemoveOperation::new("default", "k");
        let mut reader = Reader::new(&[]);
        let outcome = remove
            .read_payload(codec().as_ref(), KEY_DOES_NOT_EXIST_STATUS, &mut reader)
            .unwrap();
        assert!(!outcome.executed);

        let contains = ContainsKeyOperation::new("default", "k");
        assert_eq!(contains.routing_key(), Some(&b"k"[..]));
        let mut reader = Reader::new(&[]);
        assert!(contains.read_payload(codec().as_ref(), NO_ERROR_STATUS, &mut reader).unwrap());
        let mut reader = Reader::new(&[]);
        assert!(!contains.read_payload(codec().as_ref(), KEY_DOES_NOT_EXIST_STATUS, &mut reader).unwrap());
    }

    #[test]
    fn test_size_and_clear() {
        let size = SizeOperation::new("default");
        assert_eq!(size.routing_key(), None);
        let mut reader = Reader::new(&[0xAC, 0x02]);
        assert_eq!(size.read_payload(codec().as_ref(), NO_ERROR_STATUS, &mut reader).unwrap(), 300);

        let clear = ClearOperation::new("default");
        let mut buf = BytesMut::new();
        clear.write_payload(codec().as_ref(), &mut buf);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_ping_response_negotiation() {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        write_vint(&mut buf, 12);
        write_vint(&mut buf, 1);
        write_string(&mut buf, "charset");
        write_string(&mut buf, "UTF-8");
        buf.put_u8(0);
        buf.put_u8(VERSION_30);
        write_vint(&mut buf, 2);
        buf.put_u16(u16::from(GET_REQUEST));
        buf.put_u16(u16::from(PUT_REQUEST));

        let ping = PingOperation::new("");
        let mut reader = Reader::new(&buf);
        let response = ping.read_payload(codec().as_ref(), NO_ERROR_STATUS, &mut reader).unwrap();
        assert_eq!(response.server_version, VERSION_30);
        assert_eq!(response.supported_operations, vec![0x03, 0x01]);
        assert_eq!(reader.remaining(), 0);

        let legacy = codec_for_version(VERSION_28).unwrap();
        let mut reader = Reader::new(&[]);
        assert_eq!(
            ping.read_payload(legacy.as_ref(), NO_ERROR_STATUS, &mut reader).unwrap(),
            PingResponse::default()
        );
    }
}
