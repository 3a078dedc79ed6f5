//! MQTT 3.1.1 packet codec, limited to what a capture node needs.
//!
//! ## Fixed header
//! ```text
//! | type (4 bits) | flags (4 bits) | remaining length (1-4 bytes, base-128) |
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::BrokerError;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

const FLAG_USERNAME: u8 = 0x80;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_CLEAN_SESSION: u8 = 0x02;

/// Largest value the 4-byte remaining length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
}

#[derive(Debug, Clone)]
pub struct Connect<'a> {
    pub client_id: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub keep_alive_secs: u16,
}

/// Packets a client receives from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnAck {
        session_present: bool,
        return_code: u8,
    },
    Publish {
        topic: String,
        packet_id: Option<u16>,
        payload: Bytes,
    },
    PubAck {
        packet_id: u16,
    },
    SubAck {
        packet_id: u16,
        granted: Vec<u8>,
    },
    PingResp,
    Other {
        packet_type: u8,
    },
}

pub fn encode_connect(connect: &Connect<'_>, buf: &mut BytesMut) -> Result<(), BrokerError> {
    let mut flags = FLAG_CLEAN_SESSION;
    let mut len = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2 + 2 + connect.client_id.len();
    if let Some(username) = connect.username {
        flags |= FLAG_USERNAME;
        len += 2 + username.len();
    }
    if let Some(password) = connect.password {
        flags |= FLAG_PASSWORD;
        len += 2 + password.len();
    }

    buf.put_u8(CONNECT << 4);
    put_remaining_length(buf, len)?;
    put_str(buf, PROTOCOL_NAME)?;
    buf.put_u8(PROTOCOL_LEVEL);
    buf.put_u8(flags);
    buf.put_u16(connect.keep_alive_secs);
    put_str(buf, connect.client_id)?;
    if let Some(username) = connect.username {
        put_str(buf, username)?;
    }
    if let Some(password) = connect.password {
        put_str(buf, password)?;
    }
    Ok(())
}

/// Writes the PUBLISH fixed and variable header. The caller writes the
/// `payload_len` payload bytes straight after it, so large frames are never
/// copied into the packet buffer.
pub fn encode_publish_header(
    topic: &str,
    packet_id: Option<u16>,
    payload_len: usize,
    buf: &mut BytesMut,
) -> Result<(), BrokerError> {
    let qos = if packet_id.is_some() {
        QoS::AtLeastOnce
    } else {
        QoS::AtMostOnce
    };
    let len = 2 + topic.len() + packet_id.map_or(0, |_| 2) + payload_len;

    buf.put_u8((PUBLISH << 4) | ((qos as u8) << 1));
    put_remaining_length(buf, len)?;
    put_str(buf, topic)?;
    if let Some(id) = packet_id {
        buf.put_u16(id);
    }
    Ok(())
}

pub fn encode_puback(packet_id: u16, buf: &mut BytesMut) {
    buf.put_u8(PUBACK << 4);
    buf.put_u8(2);
    buf.put_u16(packet_id);
}

pub fn encode_subscribe(
    packet_id: u16,
    topic: &str,
    qos: QoS,
    buf: &mut BytesMut,
) -> Result<(), BrokerError> {
    // SUBSCRIBE carries the reserved flag bits 0b0010.
    buf.put_u8((SUBSCRIBE << 4) | 0x02);
    put_remaining_length(buf, 2 + 2 + topic.len() + 1)?;
    buf.put_u16(packet_id);
    put_str(buf, topic)?;
    buf.put_u8(qos as u8);
    Ok(())
}

pub fn encode_pingreq(buf: &mut BytesMut) {
    buf.put_u8(PINGREQ << 4);
    buf.put_u8(0);
}

pub fn encode_disconnect(buf: &mut BytesMut) {
    buf.put_u8(DISCONNECT << 4);
    buf.put_u8(0);
}

/// Splits one complete packet off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed.
pub fn decode(buf: &mut BytesMut, max_packet_size: usize) -> Result<Option<Packet>, BrokerError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let Some((remaining, len_bytes)) = read_remaining_length(&buf[1..])? else {
        return Ok(None);
    };
    let total = 1 + len_bytes + remaining;
    if total > max_packet_size {
        return Err(BrokerError::protocol(format!(
            "inbound packet of {total} bytes exceeds limit of {max_packet_size}"
        )));
    }
    if buf.len() < total {
        return Ok(None);
    }

    let mut packet = buf.split_to(total).freeze();
    let header = packet.get_u8();
    packet.advance(len_bytes);

    let packet = match header >> 4 {
        CONNACK => {
            let flags = take_u8(&mut packet)?;
            let return_code = take_u8(&mut packet)?;
            Packet::ConnAck {
                session_present: flags & 0x01 == 0x01,
                return_code,
            }
        }
        PUBLISH => {
            let qos = (header >> 1) & 0x03;
            let topic_len = take_u16(&mut packet)? as usize;
            if packet.remaining() < topic_len {
                return Err(BrokerError::protocol("truncated PUBLISH topic"));
            }
            let topic = String::from_utf8(packet.split_to(topic_len).to_vec())
                .map_err(|_| BrokerError::protocol("PUBLISH topic is not UTF-8"))?;
            let packet_id = if qos > 0 {
                Some(take_u16(&mut packet)?)
            } else {
                None
            };
            Packet::Publish {
                topic,
                packet_id,
                payload: packet,
            }
        }
        PUBACK => Packet::PubAck {
            packet_id: take_u16(&mut packet)?,
        },
        SUBACK => {
            let packet_id = take_u16(&mut packet)?;
            Packet::SubAck {
                packet_id,
                granted: packet.to_vec(),
            }
        }
        PINGRESP => Packet::PingResp,
        packet_type => Packet::Other { packet_type },
    };

    Ok(Some(packet))
}

fn put_remaining_length(buf: &mut BytesMut, mut len: usize) -> Result<(), BrokerError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(BrokerError::protocol(format!(
            "packet body of {len} bytes is too large for MQTT"
        )));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// Returns `(value, bytes used)`, or `None` if the field is still incomplete.
fn read_remaining_length(bytes: &[u8]) -> Result<Option<(usize, usize)>, BrokerError> {
    let mut value = 0usize;
    for (i, byte) in bytes.iter().take(4).enumerate() {
        value += ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if bytes.len() >= 4 {
        return Err(BrokerError::protocol("malformed remaining length"));
    }
    Ok(None)
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), BrokerError> {
    let len = u16::try_from(s.len())
        .map_err(|_| BrokerError::protocol(format!("string of {} bytes is too long", s.len())))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn take_u8(packet: &mut Bytes) -> Result<u8, BrokerError> {
    if packet.remaining() < 1 {
        return Err(BrokerError::protocol("truncated packet"));
    }
    Ok(packet.get_u8())
}

fn take_u16(packet: &mut Bytes) -> Result<u16, BrokerError> {
    if packet.remaining() < 2 {
        return Err(BrokerError::protocol("truncated packet"));
    }
    Ok(packet.get_u16())
}
