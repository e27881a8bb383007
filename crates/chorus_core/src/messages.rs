//! Arbiter messages and the fixed-layout wire codec.
//!
//! Every message exchanged over the DMQ is one `ArbiterMessage` frame:
//! 90 bytes, little-endian, with a zero-padded gid field. A `PREPARE` frame
//! may be followed by the replicated change set of the transaction; use
//! [`ArbiterMessage::decode_prefix`] on the receiver side to split it off.

use bytes::{Buf, BufMut};

use crate::error::DecodeError;
use crate::gid::Gid;
use crate::mask::NodeId;

/// Fixed width of the gid field on the wire.
pub const GID_WIRE_LEN: usize = 48;

/// Total size of one encoded frame.
pub const ARBITER_MSG_LEN: usize = 2 + 5 * 8 + GID_WIRE_LEN;

/// Wire codes. The numbering is part of the on-wire format; do not reorder.
///
/// `Committed` doubles as the apply instruction sent by the coordinator and
/// the acknowledgement sent back by the participant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageCode {
    Prepare = 1,
    Prepared = 2,
    Aborted = 3,
    Precommit = 4,
    Precommitted = 5,
    Committed = 6,
    Abort = 7,
    Heartbeat = 8,
    PollStatus = 9,
    Status = 10,
}

impl TryFrom<u8> for MessageCode {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<MessageCode, DecodeError> {
        Ok(match v {
            1 => MessageCode::Prepare,
            2 => MessageCode::Prepared,
            3 => MessageCode::Aborted,
            4 => MessageCode::Precommit,
            5 => MessageCode::Precommitted,
            6 => MessageCode::Committed,
            7 => MessageCode::Abort,
            8 => MessageCode::Heartbeat,
            9 => MessageCode::PollStatus,
            10 => MessageCode::Status,
            other => return Err(DecodeError::UnknownCode(other)),
        })
    }
}

/// Resolver verdict carried by `Status` replies in the `sxid` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum ResolveOutcome {
    Unknown = 0,
    Commit = 1,
    Abort = 2,
}

impl ResolveOutcome {
    pub fn from_wire(v: u64) -> ResolveOutcome {
        match v {
            1 => ResolveOutcome::Commit,
            2 => ResolveOutcome::Abort,
            _ => ResolveOutcome::Unknown,
        }
    }
}

/// One arbiter frame.
///
/// Field use by code:
/// - `dxid`: xid of the transaction being voted on (gather loops match on it)
/// - `oxid`: sender's recovery generation on `Heartbeat`
/// - `sxid`: resolver outcome on `Status`
/// - `lsn`: origin position on apply traffic; applied-position ack on
///   `Heartbeat`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArbiterMessage {
    pub code: MessageCode,
    pub node: NodeId,
    pub connectivity_mask: u64,
    pub dxid: u64,
    pub oxid: u64,
    pub sxid: u64,
    pub lsn: u64,
    pub gid: Option<Gid>,
}

impl ArbiterMessage {
    /// Zero-initialized frame, matching the sender's habit of filling only
    /// the fields its code uses.
    pub fn new(code: MessageCode, node: NodeId) -> ArbiterMessage {
        ArbiterMessage {
            code,
            node,
            connectivity_mask: 0,
            dxid: 0,
            oxid: 0,
            sxid: 0,
            lsn: 0,
            gid: None,
        }
    }

    pub fn heartbeat(
        node: NodeId,
        connectivity_mask: u64,
        recovery_count: u64,
        applied_lsn: u64,
    ) -> ArbiterMessage {
        ArbiterMessage {
            connectivity_mask,
            oxid: recovery_count,
            lsn: applied_lsn,
            ..ArbiterMessage::new(MessageCode::Heartbeat, node)
        }
    }

    /// Vote reply in a gather phase (`Prepared`, `Aborted`, `Precommitted`,
    /// `Committed`).
    pub fn vote(code: MessageCode, node: NodeId, dxid: u64, gid: Gid) -> ArbiterMessage {
        ArbiterMessage {
            dxid,
            gid: Some(gid),
            ..ArbiterMessage::new(code, node)
        }
    }

    pub fn poll_status(node: NodeId, gid: Gid) -> ArbiterMessage {
        ArbiterMessage {
            gid: Some(gid),
            ..ArbiterMessage::new(MessageCode::PollStatus, node)
        }
    }

    pub fn status(node: NodeId, gid: Gid, outcome: ResolveOutcome) -> ArbiterMessage {
        ArbiterMessage {
            sxid: outcome as u64,
            gid: Some(gid),
            ..ArbiterMessage::new(MessageCode::Status, node)
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ARBITER_MSG_LEN);
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.code as u8);
        buf.put_u8(self.node);
        buf.put_u64_le(self.connectivity_mask);
        buf.put_u64_le(self.dxid);
        buf.put_u64_le(self.oxid);
        buf.put_u64_le(self.sxid);
        buf.put_u64_le(self.lsn);
        let mut gid_buf = [0u8; GID_WIRE_LEN];
        if let Some(gid) = self.gid {
            let rendered = gid.to_string();
            let bytes = rendered.as_bytes();
            debug_assert!(bytes.len() < GID_WIRE_LEN);
            gid_buf[..bytes.len()].copy_from_slice(bytes);
        }
        buf.put_slice(&gid_buf);
    }

    /// Decode a frame occupying the whole buffer.
    pub fn decode(data: &[u8]) -> Result<ArbiterMessage, DecodeError> {
        let (msg, rest) = ArbiterMessage::decode_prefix(data)?;
        if !rest.is_empty() {
            return Err(DecodeError::Truncated {
                need: ARBITER_MSG_LEN,
                got: data.len(),
            });
        }
        Ok(msg)
    }

    /// Decode the leading frame and return the trailing payload (the
    /// replicated change set of a `Prepare`).
    pub fn decode_prefix(data: &[u8]) -> Result<(ArbiterMessage, &[u8]), DecodeError> {
        if data.len() < ARBITER_MSG_LEN {
            return Err(DecodeError::Truncated {
                need: ARBITER_MSG_LEN,
                got: data.len(),
            });
        }
        let (mut frame, rest) = data.split_at(ARBITER_MSG_LEN);
        let code = MessageCode::try_from(frame.get_u8())?;
        let node = frame.get_u8();
        let connectivity_mask = frame.get_u64_le();
        let dxid = frame.get_u64_le();
        let oxid = frame.get_u64_le();
        let sxid = frame.get_u64_le();
        let lsn = frame.get_u64_le();

        let gid_field = &frame[..GID_WIRE_LEN];
        let end = gid_field
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(GID_WIRE_LEN);
        let gid = if end == 0 {
            None
        } else {
            let text = std::str::from_utf8(&gid_field[..end])
                .map_err(|_| DecodeError::BadGid(format!("{:?}", &gid_field[..end])))?;
            Some(
                text.parse::<Gid>()
                    .map_err(|_| DecodeError::BadGid(text.to_string()))?,
            )
        };

        Ok((
            ArbiterMessage {
                code,
                node,
                connectivity_mask,
                dxid,
                oxid,
                sxid,
                lsn,
                gid,
            },
            rest,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_codes() {
        for code in [
            MessageCode::Prepare,
            MessageCode::Prepared,
            MessageCode::Aborted,
            MessageCode::Precommit,
            MessageCode::Precommitted,
            MessageCode::Committed,
            MessageCode::Abort,
            MessageCode::Heartbeat,
            MessageCode::PollStatus,
            MessageCode::Status,
        ] {
            let msg = ArbiterMessage {
                code,
                node: 7,
                connectivity_mask: 0b101,
                dxid: 99,
                oxid: 3,
                sxid: 1,
                lsn: 12345,
                gid: Some(Gid::new(7, 99)),
            };
            let encoded = msg.encode();
            assert_eq!(encoded.len(), ARBITER_MSG_LEN);
            assert_eq!(ArbiterMessage::decode(&encoded).unwrap(), msg);
        }
    }

    #[test]
    fn empty_gid_roundtrips_as_none() {
        let msg = ArbiterMessage::heartbeat(2, 0b11, 5, 77);
        let decoded = ArbiterMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.gid, None);
        assert_eq!(decoded.oxid, 5);
        assert_eq!(decoded.lsn, 77);
    }

    #[test]
    fn unknown_code_is_fatal() {
        let mut encoded = ArbiterMessage::new(MessageCode::Heartbeat, 1).encode();
        encoded[0] = 0xEE;
        assert!(matches!(
            ArbiterMessage::decode(&encoded),
            Err(DecodeError::UnknownCode(0xEE))
        ));
    }

    #[test]
    fn truncated_frame_rejected() {
        let encoded = ArbiterMessage::new(MessageCode::Heartbeat, 1).encode();
        assert!(matches!(
            ArbiterMessage::decode(&encoded[..ARBITER_MSG_LEN - 1]),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn prefix_decode_returns_payload() {
        let mut buf = ArbiterMessage::vote(
            MessageCode::Prepare,
            1,
            42,
            Gid::new(1, 42),
        )
        .encode();
        buf.extend_from_slice(b"changeset-bytes");
        let (msg, rest) = ArbiterMessage::decode_prefix(&buf).unwrap();
        assert_eq!(msg.code, MessageCode::Prepare);
        assert_eq!(rest, b"changeset-bytes");
    }

    #[test]
    fn garbage_gid_rejected() {
        let mut encoded = ArbiterMessage::new(MessageCode::Status, 1).encode();
        let gid_off = ARBITER_MSG_LEN - GID_WIRE_LEN;
        encoded[gid_off..gid_off + 4].copy_from_slice(b"junk");
        assert!(matches!(
            ArbiterMessage::decode(&encoded),
            Err(DecodeError::BadGid(_))
        ));
    }
}
