use bytes::{Buf, BufMut, Bytes, BytesMut};
use fxp_common::{FxpError, FxpResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::attrs::FileAttributes;
use crate::types::PacketType;

/// Length field plus type tag
const HEADER_LEN: usize = 5;

/// Upper bound on a declared packet length accepted from the wire.
pub const MAX_PACKET_LEN: usize = 1 << 24;

/// An outgoing packet under construction.
///
/// Space for the length and type fields is reserved up front and
/// back-patched by [`PacketBuilder::finish`].
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    packet_type: u8,
    buf: BytesMut,
}

impl PacketBuilder {
    pub fn new(packet_type: PacketType) -> Self {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_bytes(0, HEADER_LEN);
        Self {
            packet_type: packet_type.as_u8(),
            buf,
        }
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u8(self.packet_type)
    }

    pub fn set_type(&mut self, packet_type: PacketType) {
        self.packet_type = packet_type.as_u8();
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn put_string(&mut self, value: &[u8]) {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
    }

    pub fn put_str(&mut self, value: &str) {
        self.put_string(value.as_bytes());
    }

    pub fn put_attrs(&mut self, attrs: &FileAttributes) {
        attrs.encode(self);
    }

    /// Length of the payload written so far, type tag excluded.
    pub fn payload_len(&self) -> usize {
        self.buf.len() - HEADER_LEN
    }

    /// Back-patches the header and returns the wire form.
    pub fn finish(mut self) -> Bytes {
        let length = (self.buf.len() - 4) as u32;
        self.buf[..4].copy_from_slice(&length.to_be_bytes());
        self.buf[4] = self.packet_type;
        self.buf.freeze()
    }

    /// Loops a built packet straight back into its received form.
    pub fn into_packet(self) -> Packet {
        let packet_type = self.packet_type;
        let mut data = self.finish();
        data.advance(HEADER_LEN);
        Packet { packet_type, data }
    }
}

/// A received packet: the type tag plus a cursor over the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    packet_type: u8,
    data: Bytes,
}

/// A packet whose declared length is known but whose body is still
/// arriving.
#[derive(Debug)]
pub struct ReceivingPacket {
    declared_len: usize,
    buf: BytesMut,
}

impl ReceivingPacket {
    /// Number of body bytes still expected.
    pub fn missing(&self) -> usize {
        self.declared_len - self.buf.len()
    }

    /// Appends body bytes, returning how many were taken.
    pub fn extend(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.missing());
        self.buf.extend_from_slice(&data[..take]);
        take
    }

    pub fn finish_receive(self) -> FxpResult<Packet> {
        if self.missing() > 0 {
            return Err(FxpError::MalformedPacket("truncated packet body"));
        }
        Packet::from_body(self.buf.freeze())
    }
}

impl Packet {
    pub fn begin_receive(declared_len: usize) -> ReceivingPacket {
        ReceivingPacket {
            declared_len,
            buf: BytesMut::with_capacity(declared_len.min(MAX_PACKET_LEN)),
        }
    }

    /// Takes the body of a packet (everything after the length field).
    pub fn from_body(mut body: Bytes) -> FxpResult<Self> {
        if body.is_empty() {
            return Err(FxpError::MalformedPacket("packet shorter than type tag"));
        }
        let packet_type = body.get_u8();
        Ok(Self {
            packet_type,
            data: body,
        })
    }

    /// Parses a complete length-prefixed packet.
    pub fn from_wire(mut wire: Bytes) -> FxpResult<Self> {
        if wire.len() < 4 {
            return Err(FxpError::MalformedPacket("missing length field"));
        }
        let length = wire.get_u32() as usize;
        if wire.len() != length {
            return Err(FxpError::MalformedPacket("length field mismatch"));
        }
        Self::from_body(wire)
    }

    pub fn raw_type(&self) -> u8 {
        self.packet_type
    }

    pub fn kind(&self) -> Option<PacketType> {
        PacketType::from_u8(self.packet_type)
    }

    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    pub fn get_u8(&mut self) -> FxpResult<u8> {
        if self.data.remaining() < 1 {
            return Err(FxpError::MalformedPacket("truncated byte"));
        }
        Ok(self.data.get_u8())
    }

    pub fn get_u32(&mut self) -> FxpResult<u32> {
        if self.data.remaining() < 4 {
            return Err(FxpError::MalformedPacket("truncated uint32"));
        }
        Ok(self.data.get_u32())
    }

    pub fn get_u64(&mut self) -> FxpResult<u64> {
        if self.data.remaining() < 8 {
            return Err(FxpError::MalformedPacket("truncated uint64"));
        }
        Ok(self.data.get_u64())
    }

    pub fn get_string(&mut self) -> FxpResult<Bytes> {
        let len = self.get_u32()? as usize;
        if self.data.remaining() < len {
            return Err(FxpError::MalformedPacket("string runs past end of packet"));
        }
        Ok(self.data.split_to(len))
    }

    pub fn get_str(&mut self) -> FxpResult<String> {
        let raw = self.get_string()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| FxpError::MalformedPacket("string is not valid UTF-8"))
    }

    /// Reads a string, replacing invalid UTF-8 sequences. Filenames are
    /// byte strings on the wire and are read this way.
    pub fn get_str_lossy(&mut self) -> FxpResult<String> {
        let raw = self.get_string()?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    pub fn get_attrs(&mut self) -> FxpResult<FileAttributes> {
        FileAttributes::decode(self)
    }
}

/// Parse all complete SFTP packets from a reassembly buffer.
/// Consumes parsed bytes from `buf`, leaving any incomplete trailing data.
/// Packets too short to carry a type tag are logged and skipped.
pub fn parse_all_packets(buf: &mut BytesMut) -> FxpResult<Vec<Packet>> {
    let mut packets = Vec::new();
    loop {
        if buf.len() < 4 {
            break;
        }
        let pkt_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if pkt_len > MAX_PACKET_LEN {
            return Err(FxpError::MalformedPacket("packet length exceeds limit"));
        }
        if buf.len() < 4 + pkt_len {
            break;
        }
        buf.advance(4);
        let body = buf.split_to(pkt_len).freeze();
        match Packet::from_body(body) {
            Ok(packet) => packets.push(packet),
            Err(e) => {
                tracing::debug!(packet_len = pkt_len, error = %e, "SFTP packet parse failed, skipping");
            }
        }
    }
    Ok(packets)
}

/// Reads one packet, returning `None` on a clean end of stream between
/// packets.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> FxpResult<Option<Packet>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let declared_len = u32::from_be_bytes(header) as usize;
    if declared_len > MAX_PACKET_LEN {
        return Err(FxpError::MalformedPacket("packet length exceeds limit"));
    }

    let mut receiving = Packet::begin_receive(declared_len);
    let mut body = vec![0u8; declared_len];
    reader.read_exact(&mut body).await?;
    receiving.extend(&body);
    receiving.finish_receive().map(Some)
}

pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: PacketBuilder) -> FxpResult<()> {
    writer.write_all(&packet.finish()).await?;
    writer.flush().await?;
    Ok(())
}
