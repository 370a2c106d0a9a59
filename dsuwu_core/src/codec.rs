//! Wire framing, CRC32 and little-endian struct encode/decode for every
//! DSU message.

/// 16-byte packet header followed by a 4-byte `msg_type` and a
/// message-specific payload.
pub const HEADER_LEN: usize = 16;
/// Minimum total packet length: header + `msg_type`.
pub const MIN_PACKET_LEN: usize = HEADER_LEN + 4;

pub const MAGIC_SERVER: [u8; 4] = *b"DSUS";
pub const MAGIC_CLIENT: [u8; 4] = *b"DSUC";

pub const MSG_VERSION: u32 = 0x100000;
pub const MSG_LIST_PORTS: u32 = 0x100001;
pub const MSG_BUTTON: u32 = 0x100002;
pub const MSG_MOTOR_REQUEST: u32 = 0x110001;
pub const MSG_MOTOR_COMMAND: u32 = 0x110002;

/// A successfully framed and CRC-verified packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPacket {
    pub magic: [u8; 4],
    pub protocol_version: u16,
    pub msg_type: u32,
    /// Payload bytes following `msg_type` (does not include `msg_type` itself).
    pub payload: Vec<u8>,
}

fn crc32_ieee(data: &[u8]) -> u32 {
    crc::crc32::checksum_ieee(data)
}

/// Builds header + `msg_type` + `payload`, computing the CRC over the header
/// (with its CRC field zeroed) concatenated with `msg_type` and `payload`.
pub fn encode(magic: [u8; 4], protocol_version: u16, id: u32, msg_type: u32, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(4 + payload.len());
    msg.extend_from_slice(&msg_type.to_le_bytes());
    msg.extend_from_slice(payload);

    let length = msg.len() as u16;

    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&magic);
    header[4..6].copy_from_slice(&protocol_version.to_le_bytes());
    header[6..8].copy_from_slice(&length.to_le_bytes());
    // header[8..12] (crc) left zeroed for the CRC computation pass
    header[12..16].copy_from_slice(&id.to_le_bytes());

    let mut crc_input = Vec::with_capacity(HEADER_LEN + msg.len());
    crc_input.extend_from_slice(&header);
    crc_input.extend_from_slice(&msg);
    let crc = crc32_ieee(&crc_input);
    header[8..12].copy_from_slice(&crc.to_le_bytes());

    let mut out = Vec::with_capacity(HEADER_LEN + msg.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&msg);
    out
}

/// Why a datagram failed [`validate_and_parse`], for `trace!`-level
/// diagnostics only — callers never surface this to the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("packet shorter than the minimum frame size")]
    TooShort,
    #[error("magic bytes did not match")]
    WrongMagic,
    #[error("declared length field is implausible")]
    BadLength,
    #[error("CRC-32 checksum mismatch")]
    BadCrc,
}

fn classify(buf: &[u8], expected_magic: [u8; 4]) -> Result<ParsedPacket, CodecError> {
    if buf.len() < MIN_PACKET_LEN {
        return Err(CodecError::TooShort);
    }

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&buf[0..4]);
    if magic != expected_magic {
        return Err(CodecError::WrongMagic);
    }

    let protocol_version = u16::from_le_bytes([buf[4], buf[5]]);
    let length = u16::from_le_bytes([buf[6], buf[7]]) as usize;
    let crc = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);

    if length < 4 || length != buf.len() - HEADER_LEN {
        return Err(CodecError::BadLength);
    }

    let mut crc_input = Vec::with_capacity(buf.len());
    crc_input.extend_from_slice(&buf[0..8]);
    crc_input.extend_from_slice(&[0u8; 4]);
    crc_input.extend_from_slice(&buf[12..HEADER_LEN]);
    crc_input.extend_from_slice(&buf[HEADER_LEN..]);
    if crc32_ieee(&crc_input) != crc {
        return Err(CodecError::BadCrc);
    }

    let msg_type = u32::from_le_bytes([
        buf[HEADER_LEN],
        buf[HEADER_LEN + 1],
        buf[HEADER_LEN + 2],
        buf[HEADER_LEN + 3],
    ]);
    let payload = buf[HEADER_LEN + 4..].to_vec();

    Ok(ParsedPacket {
        magic,
        protocol_version,
        msg_type,
        payload,
    })
}

/// Validates framing and CRC, returning the parsed header fields and payload.
///
/// Rejects (returns `None`) if: `buf.len() < 20`, the magic doesn't match
/// `expected_magic`, the declared length is `< 4`, the declared length
/// doesn't equal `buf.len() - 16`, or the CRC doesn't match. Malformed
/// packets are never reported back to the sender; the rejection reason is
/// only ever logged at `trace!` level.
pub fn validate_and_parse(buf: &[u8], expected_magic: [u8; 4]) -> Option<ParsedPacket> {
    match classify(buf, expected_magic) {
        Ok(packet) => Some(packet),
        Err(err) => {
            log::trace!(target: "dsuwu_core::codec", "dropping malformed packet: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_and_parse() {
        let packet = encode(MAGIC_SERVER, 1001, 0xDEAD_BEEF, MSG_VERSION, &[1, 2, 3, 4]);
        let parsed = validate_and_parse(&packet, MAGIC_SERVER).expect("valid packet");
        assert_eq!(parsed.magic, MAGIC_SERVER);
        assert_eq!(parsed.protocol_version, 1001);
        assert_eq!(parsed.msg_type, MSG_VERSION);
        assert_eq!(parsed.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn rejects_short_buffers() {
        assert!(validate_and_parse(&[0u8; 10], MAGIC_CLIENT).is_none());
    }

    #[test]
    fn rejects_wrong_magic() {
        let packet = encode(MAGIC_SERVER, 1001, 0, MSG_VERSION, &[]);
        assert!(validate_and_parse(&packet, MAGIC_CLIENT).is_none());
    }

    #[test]
    fn rejects_tampered_payload() {
        let mut packet = encode(MAGIC_CLIENT, 1001, 0, MSG_VERSION, &[1, 2]);
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;
        assert!(validate_and_parse(&packet, MAGIC_CLIENT).is_none());
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut packet = encode(MAGIC_CLIENT, 1001, 0, MSG_VERSION, &[1, 2]);
        // Corrupt the declared length field without touching the CRC.
        packet[6] = 0xFF;
        assert!(validate_and_parse(&packet, MAGIC_CLIENT).is_none());
    }
}
