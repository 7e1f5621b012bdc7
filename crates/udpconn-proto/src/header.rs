//! Fixed 5-byte wire header shared by every datagram: session id, packet id,
//! and a flag byte describing what kind of frame follows.

use udpconn_binary::{BinaryReader, BinaryWriter, Readable, Result, Writable};

pub const HEADER_LEN: usize = 5;

/// Upper bound on a single datagram, header included. Chosen to stay well
/// under the common internet MTU without path-MTU discovery.
pub const MAX_PACKET_SIZE: usize = 1200;

pub const FLAG_DATA: u8 = 1 << 0;
pub const FLAG_ACK: u8 = 1 << 1;
pub const FLAG_SYN: u8 = 1 << 2;
pub const FLAG_SYNACK: u8 = 1 << 3;
pub const FLAG_RST: u8 = 1 << 4;
pub const FLAG_PING: u8 = 1 << 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub session_id: u16,
    pub packet_id: u16,
    pub flags: u8,
}

impl Header {
    pub fn new(session_id: u16, packet_id: u16, flags: u8) -> Self {
        Header {
            session_id,
            packet_id,
            flags,
        }
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn is_data(&self) -> bool {
        self.has_flag(FLAG_DATA)
    }

    pub fn is_ack(&self) -> bool {
        self.has_flag(FLAG_ACK)
    }

    pub fn is_syn(&self) -> bool {
        self.has_flag(FLAG_SYN)
    }

    pub fn is_synack(&self) -> bool {
        self.has_flag(FLAG_SYNACK)
    }

    pub fn is_rst(&self) -> bool {
        self.has_flag(FLAG_RST)
    }

    pub fn is_ping(&self) -> bool {
        self.has_flag(FLAG_PING)
    }

    pub fn encode(&self, writer: &mut BinaryWriter) -> Result<()> {
        self.session_id.write(writer)?;
        self.packet_id.write(writer)?;
        self.flags.write(writer)?;
        Ok(())
    }

    pub fn decode(reader: &mut BinaryReader) -> Result<Self> {
        let session_id = u16::read(reader)?;
        let packet_id = u16::read(reader)?;
        let flags = u8::read(reader)?;
        Ok(Header::new(session_id, packet_id, flags))
    }

    /// Encodes the header followed by `payload` into a single buffer.
    pub fn encode_with_payload(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut writer = BinaryWriter::new();
        self.encode(&mut writer)?;
        writer.write_bytes(payload)?;
        Ok(writer.freeze().to_vec())
    }
}
