//! MQTT v4 packet I/O.
//!
//! Thin async wrappers around the `rumqttc::mqttbytes` v4 codec: packets are
//! accumulated into a `BytesMut` until the codec can decode one, and encoded
//! into a scratch buffer before a single vectored write.

use bytes::{BufMut, BytesMut};
use rumqttc::mqttbytes::{self, v4};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

/// Upper bound on a single MQTT packet accepted from a client.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Read one packet, pulling more bytes from the socket as needed.
pub async fn read_packet<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<v4::Packet>
where
    R: AsyncRead + Unpin,
{
    loop {
        match v4::read(buf, max_size) {
            Ok(packet) => return Ok(packet),
            Err(mqttbytes::Error::InsufficientBytes(_)) => {
                let n = reader.read_buf(buf).await?;
                if n == 0 {
                    return Err(Error::ConnectionClosed);
                }
            }
            Err(e) => return Err(Error::Protocol(e.to_string())),
        }
    }
}

/// Encode and write one packet.
pub async fn write_packet<W>(writer: &mut W, packet: v4::Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    let result = match packet {
        v4::Packet::ConnAck(p) => p.write(&mut buf),
        v4::Packet::Publish(p) => p.write(&mut buf),
        v4::Packet::SubAck(p) => p.write(&mut buf),
        v4::Packet::UnsubAck(p) => p.write(&mut buf),
        v4::Packet::PingResp => {
            buf.put_slice(&[0xd0, 0x00]);
            Ok(buf.len())
        }
        other => {
            return Err(Error::Protocol(format!(
                "refusing to write {other:?} from the broker side"
            )))
        }
    };
    result.map_err(|e| Error::Protocol(e.to_string()))?;
    writer.write_all(&buf).await?;
    Ok(())
}

/// Build a CONNACK with the given return code.
pub fn connack(code: v4::ConnectReturnCode) -> v4::Packet {
    v4::Packet::ConnAck(v4::ConnAck {
        session_present: false,
        code,
    })
}

/// Build a QoS 0 PUBLISH.
pub fn publish(topic: &str, payload: &[u8]) -> v4::Packet {
    v4::Packet::Publish(v4::Publish {
        dup: false,
        qos: mqttbytes::QoS::AtMostOnce,
        retain: false,
        topic: topic.to_string(),
        pkid: 0,
        payload: bytes::Bytes::copy_from_slice(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_publish() {
        let packet = publish("/device/c1/r", b"{\"x\":1}");
        let mut wire = Vec::new();
        write_packet(&mut wire, packet).await.unwrap();

        let mut reader = std::io::Cursor::new(wire);
        let mut buf = BytesMut::new();
        let decoded = read_packet(&mut reader, &mut buf, MAX_PACKET_SIZE)
            .await
            .unwrap();
        match decoded {
            v4::Packet::Publish(p) => {
                assert_eq!(p.topic, "/device/c1/r");
                assert_eq!(&p.payload[..], b"{\"x\":1}");
                assert_eq!(p.qos, mqttbytes::QoS::AtMostOnce);
            }
            other => panic!("expected publish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_is_connection_closed() {
        let mut reader = std::io::Cursor::new(Vec::<u8>::new());
        let mut buf = BytesMut::new();
        let err = read_packet(&mut reader, &mut buf, MAX_PACKET_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }
}
