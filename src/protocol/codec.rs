//! Versioned Hot Rod codec (2.8, 3.0, 3.1)

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;

use super::wire::{write_array, write_vint, write_vlong, Reader};
use super::*;
use crate::core::{ClientIntelligence, ServerAddress};
use crate::error::DecodeError;
use crate::event::{ClientEvent, CounterEvent, CounterState, EventKind};

// Time unit nibbles for expiration parameters
const TIME_UNIT_MILLISECONDS: u8 = 0x01;
const TIME_UNIT_DEFAULT: u8 = 0x07;
const TIME_UNIT_INFINITE: u8 = 0x08;

// Media type marker: nothing negotiated, the server stores raw bytes
const MEDIA_TYPE_NONE: u8 = 0x00;

/// Codec for a single protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotRodCodec {
    version: u8,
}

impl HotRodCodec {
    pub fn new(version: u8) -> Option<Self> {
        match version {
            VERSION_28 | VERSION_30 | VERSION_31 => Some(Self { version }),
            _ => None,
        }
    }

    fn has_media_types(&self) -> bool {
        self.version >= VERSION_30
    }

    fn read_topology(
        &self,
        reader: &mut Reader<'_>,
        intelligence: ClientIntelligence,
    ) -> Result<TopologyUpdate, DecodeError> {
        let topology_id = reader.read_vint()? as i32;
        let server_count = reader.read_vint()? as usize;
        let mut servers = Vec::with_capacity(server_count.min(1024));
        for _ in 0..server_count {
            let host = reader.read_string()?;
            let port = reader.read_u16()?;
            servers.push(ServerAddress::new(host, port));
        }

        let mut hash_function_version = -1;
        let mut segment_owners = Vec::new();
        if intelligence == ClientIntelligence::HashDistributionAware {
            hash_function_version = i16::from(reader.read_u8()?);
            if hash_function_version > 0 {
                let segments = reader.read_vint()? as usize;
                segment_owners.reserve(segments.min(8192));
                for _ in 0..segments {
                    let owner_count = reader.read_u8()? as usize;
                    let mut owners = Vec::with_capacity(owner_count);
                    for _ in 0..owner_count {
                        let index = reader.read_vint()? as usize;
                        let owner = servers.get(index).ok_or_else(|| {
                            DecodeError::InvalidResponse(format!(
                                "Segment owner index {} out of range ({} servers)",
                                index,
                                servers.len()
                            ))
                        })?;
                        owners.push(owner.clone());
                    }
                    segment_owners.push(owners);
                }
            }
        }

        Ok(TopologyUpdate {
            topology_id,
            servers,
            hash_function_version,
            segment_owners,
        })
    }
}

impl Codec for HotRodCodec {
    fn version(&self) -> u8 {
        self.version
    }

    fn write_header(&self, buf: &mut BytesMut, header: &RequestHeader<'_>) {
        buf.put_u8(REQUEST_MAGIC);
        write_vlong(buf, header.message_id);
        buf.put_u8(self.version);
        buf.put_u8(header.op_code);
        write_array(buf, header.cache_name.as_bytes());
        write_vint(buf, header.flags);
        buf.put_u8(header.intelligence.value());
        write_vint(buf, header.topology_id as u32);
        if self.has_media_types() {
            buf.put_u8(MEDIA_TYPE_NONE);
            buf.put_u8(MEDIA_TYPE_NONE);
        }
    }

    fn write_expiration(&self, buf: &mut BytesMut, lifespan: Option<Duration>, max_idle: Option<Duration>) {
        let unit = |duration: Option<Duration>| match duration {
            None => TIME_UNIT_DEFAULT,
            Some(d) if d.is_zero() => TIME_UNIT_INFINITE,
            Some(_) => TIME_UNIT_MILLISECONDS,
        };
        buf.put_u8((unit(lifespan) << 4) | unit(max_idle));
        for duration in [lifespan, max_idle].into_iter().flatten() {
            if !duration.is_zero() {
                write_vlong(buf, duration.as_millis() as u64);
            }
        }
    }

    fn read_message_id(&self, reader: &mut Reader<'_>) -> Result<u64, DecodeError> {
        let magic = reader.read_u8()?;
        if magic != RESPONSE_MAGIC {
            return Err(DecodeError::InvalidMagic {
                expected: RESPONSE_MAGIC,
                actual: magic,
            });
        }
        reader.read_vlong()
    }

    fn read_op_code(&self, reader: &mut Reader<'_>) -> Result<u8, DecodeError> {
        reader.read_u8()
    }

    fn read_header(&self, reader: &mut Reader<'_>, ctx: &HeaderContext) -> Result<ResponseHeader, DecodeError> {
        let status = reader.read_u8()?;
        let topology = if reader.read_u8()? == 1 {
            Some(self.read_topology(reader, ctx.intelligence)?)
        } else {
            None
        };

        if ctx.received_op_code == ERROR_RESPONSE {
            let message = reader.read_string()?;
            return Ok(ResponseHeader {
                status,
                topology,
                error: Some(message),
            });
        }

        if ctx.received_op_code != ctx.expected_op_code {
            return Err(DecodeError::InvalidResponse(format!(
                "Invalid response operation for message {}: expected {:#04x} and received {:#04x}",
                ctx.message_id, ctx.expected_op_code, ctx.received_op_code
            )));
        }

        Ok(ResponseHeader {
            status,
            topology,
            error: None,
        })
    }

    fn read_cache_event(&self, reader: &mut Reader<'_>, op_code: u8) -> Result<(Bytes, ClientEvent), DecodeError> {
        let _status = reader.read_u8()?;
        // Events never carry topology
        let _topology_marker = reader.read_u8()?;
        let listener_id = reader.read_array()?;
        let is_custom = reader.read_u8()?;
        let retried = reader.read_bool()?;

        let kind = match op_code {
            CACHE_ENTRY_CREATED_EVENT => EventKind::Created,
            CACHE_ENTRY_MODIFIED_EVENT => EventKind::Modified,
            CACHE_ENTRY_REMOVED_EVENT => EventKind::Removed,
            CACHE_ENTRY_EXPIRED_EVENT => EventKind::Expired,
            other => {
                return Err(DecodeError::InvalidResponse(format!(
                    "Unknown event operation {:#04x}",
                    other
                )))
            }
        };

        let event = if is_custom != 0 {
            ClientEvent::Custom {
                kind,
                data: reader.read_array()?,
                retried,
            }
        } else {
            let key = reader.read_array()?;
            match kind {
                EventKind::Created => ClientEvent::Created {
                    key,
                    version: reader.read_i64()?,
                    retried,
                },
                EventKind::Modified => ClientEvent::Modified {
                    key,
                    version: reader.read_i64()?,
                    retried,
                },
                EventKind::Removed => ClientEvent::Removed { key, retried },
                EventKind::Expired => ClientEvent::Expired { key },
            }
        };

        Ok((listener_id, event))
    }

    fn read_counter_event(&self, reader: &mut Reader<'_>) -> Result<CounterEvent, DecodeError> {
        let _status = reader.read_u8()?;
        let _topology_marker = reader.read_u8()?;
        let counter_name = reader.read_string()?;
        let listener_id = reader.read_array()?;
        let state = reader.read_u8()?;
        let old_value = reader.read_i64()?;
        let new_value = reader.read_i64()?;
        Ok(CounterEvent {
            counter_name,
            listener_id,
            old_value,
            old_state: CounterState::from_bits(state),
            new_value,
            new_state: CounterState::from_bits(state >> 2),
        })
    }

    fn echoes_event_message_id(&self) -> bool {
        self.version >= VERSION_30
    }
}

/// Shared codec instance for a negotiated version
pub fn codec_for_version(version: u8) -> Option<Arc<dyn Codec>> {
    HotRodCodec::new(version).map(|codec| Arc::new(codec) as Arc<dyn Codec>)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(received: u8, expected: u8, intelligence: ClientIntelligence) -> HeaderContext {
        HeaderContext {
            message_id: 7,
            received_op_code: received,
            expected_op_code: expected,
            intelligence,
        }
    }

    #[test]
    fn test_unsupported_version() {
        assert!(HotRodCodec::new(20).is_none());
        assert!(codec_for_version(VERSION_30).is_some());
    }

    #[test]
    fn test_write_header_with_media_types() {
        let codec = HotRodCodec::new(VERSION_31).unwrap();
        let mut buf = BytesMut::new();
        codec.write_header(
            &mut buf,
            &RequestHeader {
                message_id: 5,
                op_code: GET_REQUEST,
                cache_name: "books",
                flags: 0,
                intelligence: ClientIntelligence::HashDistributionAware,
                topology_id: DEFAULT_CACHE_TOPOLOGY,
            },
        );

        let mut expected = vec![REQUEST_MAGIC, 5, VERSION_31, GET_REQUEST, 5];
        expected.extend_from_slice(b"books");
        expected.extend_from_slice(&[0, 3, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F, 0, 0]);
        assert_eq!(&buf[..], &expected[..]);

        let old = HotRodCodec::new(VERSION_28).unwrap();
        let mut legacy = BytesMut::new();
        old.write_header(
            &mut legacy,
            &RequestHeader {
                message_id: 5,
                op_code: GET_REQUEST,
                cache_name: "books",
                flags: 0,
                intelligence: ClientIntelligence::HashDistributionAware,
                topology_id: DEFAULT_CACHE_TOPOLOGY,
            },
        );
        assert_eq!(legacy.len(), buf.len() - 2);
    }

    #[test]
    fn test_write_expiration() {
        let codec = HotRodCodec::new(VERSION_31).unwrap();

        let mut buf = BytesMut::new();
        codec.write_expiration(&mut buf, None, None);
        assert_eq!(&buf[..], &[0x77]);

        let mut buf = BytesMut::new();
        codec.write_expiration(&mut buf, Some(Duration::from_millis(1500)), Some(Duration::ZERO));
        assert_eq!(buf[0], 0x18);
        let mut reader = Reader::new(&buf[1..]);
        assert_eq!(reader.read_vlong().unwrap(), 1500);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_read_header_with_hash_topology() {
        let codec = HotRodCodec::new(VERSION_31).unwrap();
        let mut buf = BytesMut::new();
        buf.put_u8(NO_ERROR_STATUS);
        buf.put_u8(1);
        write_vint(&mut buf, 11);
        write_vint(&mut buf, 2);
        super::super::wire::write_string(&mut buf, "node-a");
        buf.put_u16(11222);
        super::super::wire::write_string(&mut buf, "node-b");
        buf.put_u16(11222);
        buf.put_u8(3);
        write_vint(&mut buf, 2);
        buf.put_u8(2);
        write_vint(&mut buf, 0);
        write_vint(&mut buf, 1);
        buf.put_u8(1);
        write_vint(&mut buf, 1);

        let mut reader = Reader::new(&buf);
        let header = codec
            .read_header(&mut reader, &context(GET_RESPONSE, GET_RESPONSE, ClientIntelligence::HashDistributionAware))
            .unwrap();
        let topology = header.topology.unwrap();
        assert_eq!(topology.topology_id, 11);
        assert_eq!(topology.hash_function_version, 3);
        assert_eq!(topology.segment_owners.len(), 2);
        assert_eq!(topology.segment_owners[1], vec![ServerAddress::new("node-b", 11222)]);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_read_error_response() {
        let codec = HotRodCodec::new(VERSION_31).unwrap();
        let mut buf = BytesMut::new();
        buf.put_u8(SERVER_ERROR_STATUS);
        buf.put_u8(0);
        super::super::wire::write_string(&mut buf, "boom");

        let mut reader = Reader::new(&buf);
        let header = codec
            .read_header(&mut reader, &context(ERROR_RESPONSE, GET_RESPONSE, ClientIntelligence::Basic))
            .unwrap();
        assert_eq!(header.status, SERVER_ERROR_STATUS);
        assert_eq!(header.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_unexpected_op_code() {
        let codec = HotRodCodec::new(VERSION_31).unwrap();
        let buf = [NO_ERROR_STATUS, 0];
        let mut reader = Reader::new(&buf);
        let result = codec.read_header(&mut reader, &context(PUT_RESPONSE, GET_RESPONSE, ClientIntelligence::Basic));
        assert!(matches!(result, Err(DecodeError::InvalidResponse(_))));
    }

    #[test]
    fn test_invalid_magic() {
        let codec = HotRodCodec::new(VERSION_31).unwrap();
        let mut reader = Reader::new(&[0xA0, 0x01]);
        assert_eq!(
            codec.read_message_id(&mut reader),
            Err(DecodeError::InvalidMagic {
                expected: RESPONSE_MAGIC,
                actual: 0xA0
            })
        );
    }

    #[test]
    fn test_read_cache_event() {
        let codec = HotRodCodec::new(VERSION_31).unwrap();
        let mut buf = BytesMut::new();
        buf.put_u8(NO_ERROR_STATUS);
        buf.put_u8(0);
        write_array(&mut buf, b"listener");
        buf.put_u8(0);
        buf.put_u8(1);
        write_array(&mut buf, b"key");
        buf.put_i64(42);

        let mut reader = Reader::new(&buf);
        let (listener_id, event) = codec.read_cache_event(&mut reader, CACHE_ENTRY_MODIFIED_EVENT).unwrap();
        assert_eq!(&listener_id[..], b"listener");
        assert_eq!(
            event,
            ClientEvent::Modified {
                key: Bytes::from_static(b"key"),
                version: 42,
                retried: true
            }
        );
    }

    #[test]
    fn test_read_counter_event() {
        let codec = HotRodCodec::new(VERSION_31).unwrap();
        let mut buf = BytesMut::new();
        buf.put_u8(NO_ERROR_STATUS);
        buf.put_u8(0);
        super::super::wire::write_string(&mut buf, "hits");
        write_array(&mut buf, b"counter-listener");
        buf.put_u8(0b1000);
        buf.put_i64(9);
        buf.put_i64(10);

        let mut reader = Reader::new(&buf);
        let event = codec.read_counter_event(&mut reader).unwrap();
        assert_eq!(event.counter_name, "hits");
        assert_eq!(event.old_state, CounterState::Valid);
        assert_eq!(event.new_state, CounterState::UpperBoundReached);
        assert_eq!(event.new_value, 10);
    }
}
