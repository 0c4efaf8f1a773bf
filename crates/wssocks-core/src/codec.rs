//! Binary frame codec.
//!
//! Layout: `version u8 | type u8 | payload`. Numeric fields are big-endian,
//! strings are u8-length-prefixed (max 255 bytes), DATA payload length is
//! u32. Parse branches with no variable-length field must consume the
//! payload exactly; branches ending in a variable field tolerate trailing
//! bytes.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use uuid::Uuid;

use crate::error::{Result, WssocksError};
use crate::messages::*;

fn proto_err(msg: impl Into<String>) -> WssocksError {
    WssocksError::Protocol(msg.into())
}

/// Gzip-compress a DATA payload.
pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), GzLevel::default());
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

/// Inflate a gzip-compressed DATA payload.
pub fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut dec = GzDecoder::new(data);
    let mut out = Vec::new();
    dec.read_to_end(&mut out)
        .map_err(|e| proto_err(format!("gzip decompression failed: {e}")))?;
    Ok(out)
}

// ── Packing ──────────────────────────────────────────────────────────

fn put_string(buf: &mut Vec<u8>, field: &str, s: &str) -> Result<()> {
    if s.len() > MAX_STRING_LEN {
        return Err(proto_err(format!(
            "{field} too long: {} bytes (max {MAX_STRING_LEN})",
            s.len()
        )));
    }
    buf.push(s.len() as u8);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_uuid(buf: &mut Vec<u8>, id: &Uuid) {
    buf.extend_from_slice(id.as_bytes());
}

/// Encode a message into its wire form.
pub fn pack_message(msg: &Message) -> Result<Vec<u8>> {
    let mut buf = vec![PROTOCOL_VERSION];

    match msg {
        Message::Auth { token, reverse } => {
            buf.push(FrameType::Auth as u8);
            put_string(&mut buf, "token", token)?;
            buf.push(*reverse as u8);
        }

        Message::AuthResponse { success, error } => {
            buf.push(FrameType::AuthResponse as u8);
            buf.push(*success as u8);
            if !success {
                put_string(&mut buf, "error", error.as_deref().unwrap_or(""))?;
            }
        }

        Message::Connect { connect_id, target } => {
            buf.push(FrameType::Connect as u8);
            buf.push(target.protocol() as u8);
            put_uuid(&mut buf, connect_id);
            if let ConnectTarget::Tcp { address, port } = target {
                put_string(&mut buf, "address", address)?;
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }

        Message::ConnectResponse {
            success,
            channel_id,
            connect_id,
            protocol,
            error,
        } => {
            buf.push(FrameType::ConnectResponse as u8);
            buf.push(*success as u8);
            put_uuid(&mut buf, channel_id);
            put_uuid(&mut buf, connect_id);
            buf.push(protocol.map(|p| p as u8).unwrap_or(0x00));
            if !success {
                put_string(&mut buf, "error", error.as_deref().unwrap_or(""))?;
            }
        }

        Message::Data {
            protocol,
            channel_id,
            compression,
            data,
            udp,
        } => {
            buf.push(FrameType::Data as u8);
            buf.push(*protocol as u8);
            put_uuid(&mut buf, channel_id);
            buf.push(*compression as u8);
            let payload = match compression {
                Compression::None => std::borrow::Cow::Borrowed(data.as_slice()),
                Compression::Gzip => std::borrow::Cow::Owned(gzip_compress(data)?),
            };
            buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            buf.extend_from_slice(&payload);
            match (protocol, udp) {
                (Protocol::Udp, Some(addrs)) => {
                    put_string(&mut buf, "src_addr", &addrs.src_addr)?;
                    buf.extend_from_slice(&addrs.src_port.to_be_bytes());
                    put_string(&mut buf, "dst_addr", &addrs.dst_addr)?;
                    buf.extend_from_slice(&addrs.dst_port.to_be_bytes());
                }
                (Protocol::Udp, None) => {
                    return Err(proto_err("udp data frame without addressing"));
                }
                (Protocol::Tcp, _) => {}
            }
        }

        Message::Disconnect { channel_id } => {
            buf.push(FrameType::Disconnect as u8);
            put_uuid(&mut buf, channel_id);
        }

        Message::Connector {
            connect_id,
            token,
            op,
        } => {
            buf.push(FrameType::Connector as u8);
            put_uuid(&mut buf, connect_id);
            put_string(&mut buf, "token", token)?;
            buf.push(*op as u8);
        }

        Message::ConnectorResponse {
            success,
            connect_id,
            token,
            error,
        } => {
            buf.push(FrameType::ConnectorResponse as u8);
            buf.push(*success as u8);
            put_uuid(&mut buf, connect_id);
            if !success {
                put_string(&mut buf, "error", error.as_deref().unwrap_or(""))?;
            } else if let Some(token) = token.as_deref().filter(|t| !t.is_empty()) {
                put_string(&mut buf, "token", token)?;
            }
        }
    }

    Ok(buf)
}

// ── Parsing ──────────────────────────────────────────────────────────

/// Cursor over a frame payload with bounds-checked reads.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(proto_err(format!("truncated {what}")));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn uuid(&mut self, what: &str) -> Result<Uuid> {
        let b = self.take(16, what)?;
        // take() guarantees exactly 16 bytes
        Ok(Uuid::from_bytes(b.try_into().unwrap()))
    }

    fn string(&mut self, what: &str) -> Result<String> {
        let len = self.u8(what)? as usize;
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| proto_err(format!("invalid utf-8 in {what}")))
    }

    /// The branch had no variable-length final field: trailing bytes are a
    /// framing error.
    fn finish(&self, kind: &str) -> Result<()> {
        if self.remaining() != 0 {
            return Err(proto_err(format!(
                "{} trailing bytes after {kind} frame",
                self.remaining()
            )));
        }
        Ok(())
    }

    /// The branch ended in a variable-length field: trailing bytes are
    /// tolerated.
    fn finish_lenient(&self) {}
}

/// Decode a wire frame into a message.
///
/// Fails with [`WssocksError::Protocol`] on unknown version or type, any
/// truncation, or trailing bytes after a fixed-layout frame.
pub fn parse_message(data: &[u8]) -> Result<Message> {
    let mut r = Reader::new(data);

    let version = r.u8("version")?;
    if version != PROTOCOL_VERSION {
        return Err(proto_err(format!("unsupported protocol version: {version}")));
    }
    let frame_type = FrameType::try_from(r.u8("type")?)
        .map_err(|t| proto_err(format!("unknown frame type: 0x{t:02x}")))?;

    match frame_type {
        FrameType::Auth => {
            let token = r.string("auth token")?;
            let reverse = r.u8("auth reverse flag")? != 0;
            r.finish("auth")?;
            Ok(Message::Auth { token, reverse })
        }

        FrameType::AuthResponse => {
            let success = r.u8("auth response status")? != 0;
            if success {
                r.finish("auth_response")?;
                Ok(Message::AuthResponse {
                    success,
                    error: None,
                })
            } else {
                let error = r.string("auth response error")?;
                r.finish_lenient();
                Ok(Message::AuthResponse {
                    success,
                    error: Some(error),
                })
            }
        }

        FrameType::Connect => {
            let protocol = Protocol::try_from(r.u8("connect protocol")?)
                .map_err(|p| proto_err(format!("invalid connect protocol: 0x{p:02x}")))?;
            let connect_id = r.uuid("connect id")?;
            let target = match protocol {
                Protocol::Tcp => {
                    let address = r.string("connect address")?;
                    let port = r.u16("connect port")?;
                    ConnectTarget::Tcp { address, port }
                }
                Protocol::Udp => ConnectTarget::Udp,
            };
            r.finish("connect")?;
            Ok(Message::Connect { connect_id, target })
        }

        FrameType::ConnectResponse => {
            let success = r.u8("connect response status")? != 0;
            let channel_id = r.uuid("channel id")?;
            let connect_id = r.uuid("connect id")?;
            let protocol = match r.u8("connect response protocol")? {
                0x00 => None,
                p => Some(
                    Protocol::try_from(p)
                        .map_err(|p| proto_err(format!("invalid response protocol: 0x{p:02x}")))?,
                ),
            };
            if success {
                r.finish("connect_response")?;
                Ok(Message::ConnectResponse {
                    success,
                    channel_id,
                    connect_id,
                    protocol,
                    error: None,
                })
            } else {
                let error = r.string("connect response error")?;
                r.finish_lenient();
                Ok(Message::ConnectResponse {
                    success,
                    channel_id,
                    connect_id,
                    protocol,
                    error: Some(error),
                })
            }
        }

        FrameType::Data => {
            let protocol = Protocol::try_from(r.u8("data protocol")?)
                .map_err(|p| proto_err(format!("invalid data protocol: 0x{p:02x}")))?;
            let channel_id = r.uuid("channel id")?;
            let compression = Compression::try_from(r.u8("compression flag")?)
                .map_err(|c| proto_err(format!("invalid compression flag: 0x{c:02x}")))?;
            let data_len = r.u32("data length")? as usize;
            let raw = r.take(data_len, "data payload")?;
            let data = match compression {
                Compression::None => raw.to_vec(),
                Compression::Gzip => gzip_decompress(raw)?,
            };
            let udp = match protocol {
                Protocol::Tcp => {
                    r.finish_lenient();
                    None
                }
                Protocol::Udp => {
                    let src_addr = r.string("udp src address")?;
                    let src_port = r.u16("udp src port")?;
                    let dst_addr = r.string("udp dst address")?;
                    let dst_port = r.u16("udp dst port")?;
                    r.finish("data")?;
                    Some(UdpAddrs {
                        src_addr,
                        src_port,
                        dst_addr,
                        dst_port,
                    })
                }
            };
            Ok(Message::Data {
                protocol,
                channel_id,
                compression,
                data,
                udp,
            })
        }

        FrameType::Disconnect => {
            let channel_id = r.uuid("channel id")?;
            r.finish("disconnect")?;
            Ok(Message::Disconnect { channel_id })
        }

        FrameType::Connector => {
            let connect_id = r.uuid("connect id")?;
            let token = r.string("connector token")?;
            let op = ConnectorOp::try_from(r.u8("connector operation")?)
                .map_err(|o| proto_err(format!("invalid connector operation: 0x{o:02x}")))?;
            r.finish("connector")?;
            Ok(Message::Connector {
                connect_id,
                token,
                op,
            })
        }

        FrameType::ConnectorResponse => {
            let success = r.u8("connector response status")? != 0;
            let connect_id = r.uuid("connect id")?;
            if success {
                let token = if r.remaining() > 0 {
                    let token = r.string("connector response token")?;
                    r.finish_lenient();
                    Some(token)
                } else {
                    None
                };
                Ok(Message::ConnectorResponse {
                    success,
                    connect_id,
                    token,
                    error: None,
                })
            } else {
                let error = r.string("connector response error")?;
                r.finish_lenient();
                Ok(Message::ConnectorResponse {
                    success,
                    connect_id,
                    token: None,
                    error: Some(error),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let packed = pack_message(&msg).unwrap();
        let parsed = parse_message(&packed).unwrap();
        assert_eq!(parsed, msg);
    }

    fn sample_messages() -> Vec<Message> {
        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        vec![
            Message::Auth {
                token: "tok1".into(),
                reverse: false,
            },
            Message::Auth {
                token: "x".repeat(255),
                reverse: true,
            },
            Message::AuthResponse {
                success: true,
                error: None,
            },
            Message::AuthResponse {
                success: false,
                error: Some("invalid token".into()),
            },
            Message::Connect {
                connect_id: id_a,
                target: ConnectTarget::Tcp {
                    address: "example.test".into(),
                    port: 443,
                },
            },
            Message::Connect {
                connect_id: id_a,
                target: ConnectTarget::Udp,
            },
            Message::ConnectResponse {
                success: true,
                channel_id: id_b,
                connect_id: id_a,
                protocol: Some(Protocol::Tcp),
                error: None,
            },
            Message::ConnectResponse {
                success: false,
                channel_id: Uuid::nil(),
                connect_id: id_a,
                protocol: None,
                error: Some("connection refused".into()),
            },
            Message::Data {
                protocol: Protocol::Tcp,
                channel_id: id_b,
                compression: Compression::None,
                data: b"hello".to_vec(),
                udp: None,
            },
            Message::Data {
                protocol: Protocol::Tcp,
                channel_id: id_b,
                compression: Compression::None,
                data: Vec::new(),
                udp: None,
            },
            Message::Data {
                protocol: Protocol::Udp,
                channel_id: id_b,
                compression: Compression::None,
                data: vec![0xAB; 512],
                udp: Some(UdpAddrs {
                    src_addr: "10.0.0.1".into(),
                    src_port: 40000,
                    dst_addr: "8.8.8.8".into(),
                    dst_port: 53,
                }),
            },
            Message::Data {
                protocol: Protocol::Udp,
                channel_id: id_b,
                compression: Compression::None,
                data: b"v6".to_vec(),
                udp: Some(UdpAddrs {
                    src_addr: "::1".into(),
                    src_port: 1,
                    dst_addr: "2001:db8::2".into(),
                    dst_port: 65535,
                }),
            },
            Message::Disconnect { channel_id: id_b },
            Message::Connector {
                connect_id: id_a,
                token: "subtoken".into(),
                op: ConnectorOp::Add,
            },
            Message::Connector {
                connect_id: id_a,
                token: String::new(),
                op: ConnectorOp::Remove,
            },
            Message::ConnectorResponse {
                success: true,
                connect_id: id_a,
                token: Some("subtoken".into()),
                error: None,
            },
            Message::ConnectorResponse {
                success: true,
                connect_id: id_a,
                token: None,
                error: None,
            },
            Message::ConnectorResponse {
                success: false,
                connect_id: id_a,
                token: None,
                error: Some("duplicate".into()),
            },
        ]
    }

    #[test]
    fn roundtrip_all_variants() {
        for msg in sample_messages() {
            roundtrip(msg);
        }
    }

    #[test]
    fn roundtrip_large_payload() {
        roundtrip(Message::Data {
            protocol: Protocol::Tcp,
            channel_id: Uuid::new_v4(),
            compression: Compression::None,
            data: vec![0x5A; 1024 * 1024],
            udp: None,
        });
    }

    #[test]
    fn gzip_roundtrip_preserves_data() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let msg = Message::Data {
            protocol: Protocol::Tcp,
            channel_id: Uuid::new_v4(),
            compression: Compression::Gzip,
            data: data.clone(),
            udp: None,
        };
        let packed = pack_message(&msg).unwrap();
        // Wire length carries the compressed payload, not the original.
        assert!(packed.len() < data.len());
        match parse_message(&packed).unwrap() {
            Message::Data {
                compression, data: parsed, ..
            } => {
                assert_eq!(compression, Compression::Gzip);
                assert_eq!(parsed, data);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn version_gate() {
        let mut packed = pack_message(&Message::Disconnect {
            channel_id: Uuid::new_v4(),
        })
        .unwrap();
        packed[0] = 0x02;
        let err = parse_message(&packed).unwrap_err();
        assert!(matches!(err, WssocksError::Protocol(_)));
    }

    #[test]
    fn unknown_frame_type() {
        let err = parse_message(&[PROTOCOL_VERSION, 0x7F]).unwrap_err();
        assert!(matches!(err, WssocksError::Protocol(_)));
    }

    #[test]
    fn truncation_by_one_byte_fails() {
        for msg in sample_messages() {
            let packed = pack_message(&msg).unwrap();
            assert!(
                parse_message(&packed[..packed.len() - 1]).is_err(),
                "truncated {} parsed",
                msg.kind()
            );
        }
    }

    #[test]
    fn every_proper_prefix_fails_for_unambiguous_frames() {
        // ConnectorResponse-with-token is excluded: its no-token form is a
        // valid proper prefix by construction.
        let msgs = vec![
            Message::Disconnect {
                channel_id: Uuid::new_v4(),
            },
            Message::Connect {
                connect_id: Uuid::new_v4(),
                target: ConnectTarget::Tcp {
                    address: "example.test".into(),
                    port: 80,
                },
            },
            Message::Data {
                protocol: Protocol::Udp,
                channel_id: Uuid::new_v4(),
                compression: Compression::None,
                data: vec![7; 32],
                udp: Some(UdpAddrs {
                    src_addr: "1.2.3.4".into(),
                    src_port: 5,
                    dst_addr: "5.6.7.8".into(),
                    dst_port: 9,
                }),
            },
        ];
        for msg in msgs {
            let packed = pack_message(&msg).unwrap();
            for cut in 0..packed.len() {
                assert!(
                    parse_message(&packed[..cut]).is_err(),
                    "prefix {cut} of {} parsed",
                    msg.kind()
                );
            }
        }
    }

    #[test]
    fn trailing_bytes_rejected_on_fixed_frames() {
        let fixed = vec![
            Message::Disconnect {
                channel_id: Uuid::new_v4(),
            },
            Message::Auth {
                token: "tok".into(),
                reverse: false,
            },
            Message::AuthResponse {
                success: true,
                error: None,
            },
            Message::Connect {
                connect_id: Uuid::new_v4(),
                target: ConnectTarget::Tcp {
                    address: "h".into(),
                    port: 1,
                },
            },
        ];
        for msg in fixed {
            let mut packed = pack_message(&msg).unwrap();
            packed.push(0x00);
            assert!(
                parse_message(&packed).is_err(),
                "{} accepted trailing byte",
                msg.kind()
            );
        }
    }

    #[test]
    fn trailing_bytes_tolerated_after_variable_tail() {
        let msg = Message::Data {
            protocol: Protocol::Tcp,
            channel_id: Uuid::new_v4(),
            compression: Compression::None,
            data: b"tail".to_vec(),
            udp: None,
        };
        let mut packed = pack_message(&msg).unwrap();
        packed.push(0xFF);
        assert_eq!(parse_message(&packed).unwrap(), msg);

        let msg = Message::AuthResponse {
            success: false,
            error: Some("bad".into()),
        };
        let mut packed = pack_message(&msg).unwrap();
        packed.push(0xFF);
        assert_eq!(parse_message(&packed).unwrap(), msg);
    }

    #[test]
    fn oversized_string_rejected_on_pack() {
        let err = pack_message(&Message::Auth {
            token: "x".repeat(256),
            reverse: false,
        })
        .unwrap_err();
        assert!(matches!(err, WssocksError::Protocol(_)));
    }

    #[test]
    fn udp_data_without_addrs_rejected_on_pack() {
        let err = pack_message(&Message::Data {
            protocol: Protocol::Udp,
            channel_id: Uuid::new_v4(),
            compression: Compression::None,
            data: vec![1],
            udp: None,
        })
        .unwrap_err();
        assert!(matches!(err, WssocksError::Protocol(_)));
    }
}
