//! Protocol message model and its binary encoding.
//!
//! A message is encoded as `[tag:1][fields]`, big-endian. Handshake
//! messages (`CONNECT`, `ACCEPT`, `REJECT`, `DISCONNECT`) have one encoding
//! for every version because they are exchanged before a version has been
//! negotiated. Every other message is encoded against the negotiated
//! version: its tag must be supported by that version, and the version's
//! capabilities and quirks decide the field layout.

use crate::error::ProtocolError;
use crate::version::{Capabilities, ProtocolVersion, Quirks};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
    Connect = 0x01,
    Accept = 0x02,
    Reject = 0x03,
    KeepAlive = 0x04,
    Disconnect = 0x05,
    Suspend = 0x06,
    StartTlsRequest = 0x07,
    StartTlsResponse = 0x08,
    Request = 0x10,
    Response = 0x11,
    Event = 0x12,
}

impl MessageTag {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0x01 => Self::Connect,
            0x02 => Self::Accept,
            0x03 => Self::Reject,
            0x04 => Self::KeepAlive,
            0x05 => Self::Disconnect,
            0x06 => Self::Suspend,
            0x07 => Self::StartTlsRequest,
            0x08 => Self::StartTlsResponse,
            0x10 => Self::Request,
            0x11 => Self::Response,
            0x12 => Self::Event,
            other => return Err(ProtocolError::UnknownTag(other)),
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Accept => "ACCEPT",
            Self::Reject => "REJECT",
            Self::KeepAlive => "KEEP_ALIVE",
            Self::Disconnect => "DISCONNECT",
            Self::Suspend => "SUSPEND",
            Self::StartTlsRequest => "START_TLS_REQUEST",
            Self::StartTlsResponse => "START_TLS_RESPONSE",
            Self::Request => "REQUEST",
            Self::Response => "RESPONSE",
            Self::Event => "EVENT",
        }
    }

    /// Returns whether the tag is part of the version-independent handshake set.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::Connect | Self::Accept | Self::Reject | Self::Disconnect
        )
    }

    /// Oldest protocol version that defines this tag (`None` for handshake tags).
    pub fn min_version(self) -> Option<ProtocolVersion> {
        match self {
            Self::Connect | Self::Accept | Self::Reject | Self::Disconnect => None,
            Self::KeepAlive | Self::Request | Self::Response | Self::Event => {
                Some(ProtocolVersion::V1)
            }
            Self::Suspend => Some(ProtocolVersion::V2),
            Self::StartTlsRequest | Self::StartTlsResponse => Some(ProtocolVersion::V3),
        }
    }

    /// Returns whether a session negotiated at `version` may carry this tag.
    pub fn is_supported_by(self, version: ProtocolVersion) -> bool {
        self.min_version().map_or(true, |min| version >= min)
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a server refused a `CONNECT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    IncompatibleVersion,
    ServerUnavailable,
}

impl RejectReason {
    fn to_u8(self) -> u8 {
        match self {
            Self::IncompatibleVersion => 0,
            Self::ServerUnavailable => 1,
        }
    }

    fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::IncompatibleVersion),
            1 => Ok(Self::ServerUnavailable),
            other => Err(ProtocolError::InvalidEnum {
                name: "reject reason",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncompatibleVersion => write!(f, "INCOMPATIBLE_VERSION"),
            Self::ServerUnavailable => write!(f, "SERVER_UNAVAILABLE"),
        }
    }
}

/// The TLS requirement a client announces in `START_TLS_REQUEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsRequirement {
    None,
    Supported,
    Required,
}

impl TlsRequirement {
    const NAMES: [&'static str; 3] = ["NONE", "SUPPORTED", "REQUIRED"];
    const VARIANTS: [Self; 3] = [Self::None, Self::Supported, Self::Required];
}

/// The outcome a server announces in `START_TLS_RESPONSE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsResult {
    Plaintext,
    Ssl,
    FailedNegotiation,
}

impl TlsResult {
    const NAMES: [&'static str; 3] = ["PLAINTEXT", "SSL", "FAILED_NEGOTIATION"];
    const VARIANTS: [Self; 3] = [Self::Plaintext, Self::Ssl, Self::FailedNegotiation];
}

macro_rules! wire_enum_display {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let idx = Self::VARIANTS
                    .iter()
                    .position(|v| v == self)
                    .unwrap_or_default();
                f.write_str(Self::NAMES[idx])
            }
        }
    };
}

wire_enum_display!(TlsRequirement);
wire_enum_display!(TlsResult);

/// Identifier linking a request to its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationId {
    /// Plain session-scoped sequence number.
    Numeric(i64),
    /// Sequence number qualified by the originating session.
    Compound { origin: Uuid, sequence: i64 },
}

impl CorrelationId {
    /// Returns the sequence part of the id.
    pub fn sequence(&self) -> i64 {
        match self {
            Self::Numeric(seq) => *seq,
            Self::Compound { sequence, .. } => *sequence,
        }
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(seq) => write!(f, "{}", seq),
            Self::Compound { origin, sequence } => write!(f, "{}/{}", origin, sequence),
        }
    }
}

/// An outgoing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub correlation_id: CorrelationId,
    /// Remaining time budget of the caller. Only carried by versions with
    /// the time-constraints capability.
    pub time_constraint: Option<Duration>,
    pub payload: Bytes,
}

/// The reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub correlation_id: CorrelationId,
    pub payload: Bytes,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Connect {
        offered_versions: Vec<ProtocolVersion>,
    },
    Accept {
        version: ProtocolVersion,
    },
    Reject {
        reason: RejectReason,
        acceptable_versions: Vec<ProtocolVersion>,
    },
    KeepAlive,
    Disconnect,
    Suspend,
    StartTlsRequest {
        requirement: TlsRequirement,
    },
    StartTlsResponse {
        result: TlsResult,
    },
    Request(Request),
    Response(Response),
    Event {
        payload: Bytes,
    },
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Self::Connect { .. } => MessageTag::Connect,
            Self::Accept { .. } => MessageTag::Accept,
            Self::Reject { .. } => MessageTag::Reject,
            Self::KeepAlive => MessageTag::KeepAlive,
            Self::Disconnect => MessageTag::Disconnect,
            Self::Suspend => MessageTag::Suspend,
            Self::StartTlsRequest { .. } => MessageTag::StartTlsRequest,
            Self::StartTlsResponse { .. } => MessageTag::StartTlsResponse,
            Self::Request(_) => MessageTag::Request,
            Self::Response(_) => MessageTag::Response,
            Self::Event { .. } => MessageTag::Event,
        }
    }

    /// Encodes the message body (tag and fields) for the given session version.
    pub fn encode(&self, version: Option<ProtocolVersion>) -> Result<Bytes, ProtocolError> {
        let tag = self.tag();
        let version = check_version(tag, version)?;

        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(tag as u8);

        match self {
            Self::Connect { offered_versions } => put_versions(&mut buf, offered_versions)?,
            Self::Accept { version } => buf.put_u8(version.get()),
            Self::Reject {
                reason,
                acceptable_versions,
            } => {
                buf.put_u8(reason.to_u8());
                put_versions(&mut buf, acceptable_versions)?;
            }
            Self::KeepAlive | Self::Disconnect | Self::Suspend => {}
            Self::StartTlsRequest { requirement } => {
                let idx = TlsRequirement::VARIANTS
                    .iter()
                    .position(|v| v == requirement)
                    .unwrap_or_default();
                put_enum(&mut buf, version, idx as u8, TlsRequirement::NAMES[idx]);
            }
            Self::StartTlsResponse { result } => {
                let idx = TlsResult::VARIANTS
                    .iter()
                    .position(|v| v == result)
                    .unwrap_or_default();
                put_enum(&mut buf, version, idx as u8, TlsResult::NAMES[idx]);
            }
            Self::Request(request) => {
                let version = version.ok_or(ProtocolError::VersionRequired(tag.name()))?;
                put_correlation_id(&mut buf, version, &request.correlation_id)?;
                if version.capabilities().contains(Capabilities::TIME_CONSTRAINTS) {
                    let millis = request
                        .time_constraint
                        .map(|d| d.as_millis().clamp(1, u32::MAX as u128) as u32)
                        .unwrap_or(0);
                    buf.put_u32(millis);
                }
                put_payload(&mut buf, version, &request.payload)?;
            }
            Self::Response(response) => {
                let version = version.ok_or(ProtocolError::VersionRequired(tag.name()))?;
                put_correlation_id(&mut buf, version, &response.correlation_id)?;
                put_payload(&mut buf, version, &response.payload)?;
            }
            Self::Event { payload } => {
                let version = version.ok_or(ProtocolError::VersionRequired(tag.name()))?;
                put_payload(&mut buf, version, payload)?;
            }
        }

        Ok(buf.freeze())
    }

    /// Decodes a message body received on a session at the given version.
    pub fn decode(
        mut buf: Bytes,
        version: Option<ProtocolVersion>,
    ) -> Result<Self, ProtocolError> {
        need(&buf, 1)?;
        let tag = MessageTag::from_u8(buf.get_u8())?;
        let version = check_version(tag, version)?;

        let message = match tag {
            MessageTag::Connect => Self::Connect {
                offered_versions: get_versions(&mut buf)?,
            },
            MessageTag::Accept => {
                need(&buf, 1)?;
                Self::Accept {
                    version: ProtocolVersion::try_from(buf.get_u8())?,
                }
            }
            MessageTag::Reject => {
                need(&buf, 1)?;
                let reason = RejectReason::from_u8(buf.get_u8())?;
                Self::Reject {
                    reason,
                    acceptable_versions: get_versions(&mut buf)?,
                }
            }
            MessageTag::KeepAlive => Self::KeepAlive,
            MessageTag::Disconnect => Self::Disconnect,
            MessageTag::Suspend => Self::Suspend,
            MessageTag::StartTlsRequest => {
                let idx = get_enum(
                    &mut buf,
                    version,
                    "tls requirement",
                    &TlsRequirement::NAMES,
                )?;
                Self::StartTlsRequest {
                    requirement: TlsRequirement::VARIANTS[idx],
                }
            }
            MessageTag::StartTlsResponse => {
                let idx = get_enum(&mut buf, version, "tls result", &TlsResult::NAMES)?;
                Self::StartTlsResponse {
                    result: TlsResult::VARIANTS[idx],
                }
            }
            MessageTag::Request => {
                let version = version.ok_or(ProtocolError::VersionRequired(tag.name()))?;
                let correlation_id = get_correlation_id(&mut buf, version)?;
                let time_constraint =
                    if version.capabilities().contains(Capabilities::TIME_CONSTRAINTS) {
                        need(&buf, 4)?;
                        match buf.get_u32() {
                            0 => None,
                            millis => Some(Duration::from_millis(millis as u64)),
                        }
                    } else {
                        None
                    };
                Self::Request(Request {
                    correlation_id,
                    time_constraint,
                    payload: get_payload(&mut buf, version)?,
                })
            }
            MessageTag::Response => {
                let version = version.ok_or(ProtocolError::VersionRequired(tag.name()))?;
                Self::Response(Response {
                    correlation_id: get_correlation_id(&mut buf, version)?,
                    payload: get_payload(&mut buf, version)?,
                })
            }
            MessageTag::Event => {
                let version = version.ok_or(ProtocolError::VersionRequired(tag.name()))?;
                Self::Event {
                    payload: get_payload(&mut buf, version)?,
                }
            }
        };

        if buf.has_remaining() {
            return Err(ProtocolError::TrailingBytes(buf.remaining()));
        }
        Ok(message)
    }
}

/// Validates that `tag` may travel on a session at `version`.
fn check_version(
    tag: MessageTag,
    version: Option<ProtocolVersion>,
) -> Result<Option<ProtocolVersion>, ProtocolError> {
    if tag.is_handshake() {
        return Ok(version);
    }
    let version = version.ok_or(ProtocolError::VersionRequired(tag.name()))?;
    if !version.is_known() {
        return Err(ProtocolError::UnsupportedVersion(version.get()));
    }
    if !tag.is_supported_by(version) {
        return Err(ProtocolError::MessageNotSupported {
            tag: tag.name(),
            version: version.get(),
        });
    }
    Ok(Some(version))
}

fn need(buf: &Bytes, n: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < n {
        return Err(ProtocolError::Truncated {
            needed: n - buf.remaining(),
        });
    }
    Ok(())
}

fn put_versions(buf: &mut BytesMut, versions: &[ProtocolVersion]) -> Result<(), ProtocolError> {
    let count = u8::try_from(versions.len()).map_err(|_| ProtocolError::InvalidEnum {
        name: "version list length",
        value: versions.len().to_string(),
    })?;
    buf.put_u8(count);
    for version in versions {
        buf.put_u8(version.get());
    }
    Ok(())
}

fn get_versions(buf: &mut Bytes) -> Result<Vec<ProtocolVersion>, ProtocolError> {
    need(buf, 1)?;
    let count = buf.get_u8() as usize;
    need(buf, count)?;
    (0..count)
        .map(|_| ProtocolVersion::try_from(buf.get_u8()))
        .collect()
}

fn put_enum(buf: &mut BytesMut, version: Option<ProtocolVersion>, ordinal: u8, name: &str) {
    let as_string = version.is_some_and(|v| v.quirks().contains(Quirks::ENUMS_AS_STRINGS));
    if as_string {
        buf.put_u8(name.len() as u8);
        buf.put_slice(name.as_bytes());
    } else {
        buf.put_u8(ordinal);
    }
}

fn get_enum(
    buf: &mut Bytes,
    version: Option<ProtocolVersion>,
    name: &'static str,
    names: &[&str],
) -> Result<usize, ProtocolError> {
    let as_string = version.is_some_and(|v| v.quirks().contains(Quirks::ENUMS_AS_STRINGS));
    need(buf, 1)?;
    if as_string {
        let len = buf.get_u8() as usize;
        need(buf, len)?;
        let raw = buf.split_to(len);
        let text = std::str::from_utf8(&raw).map_err(|_| ProtocolError::InvalidUtf8)?;
        names
            .iter()
            .position(|n| *n == text)
            .ok_or_else(|| ProtocolError::InvalidEnum {
                name,
                value: text.to_string(),
            })
    } else {
        let ordinal = buf.get_u8() as usize;
        if ordinal < names.len() {
            Ok(ordinal)
        } else {
            Err(ProtocolError::InvalidEnum {
                name,
                value: ordinal.to_string(),
            })
        }
    }
}

fn put_correlation_id(
    buf: &mut BytesMut,
    version: ProtocolVersion,
    id: &CorrelationId,
) -> Result<(), ProtocolError> {
    let compound = version.capabilities().contains(Capabilities::COMPOUND_UUID);
    match (compound, id) {
        (false, CorrelationId::Numeric(seq)) => buf.put_i64(*seq),
        (true, CorrelationId::Compound { origin, sequence }) => {
            buf.put_slice(origin.as_bytes());
            buf.put_i64(*sequence);
        }
        _ => return Err(ProtocolError::CorrelationIdMismatch(version.get())),
    }
    Ok(())
}

fn get_correlation_id(
    buf: &mut Bytes,
    version: ProtocolVersion,
) -> Result<CorrelationId, ProtocolError> {
    if version.capabilities().contains(Capabilities::COMPOUND_UUID) {
        need(buf, 24)?;
        let mut raw = [0u8; 16];
        buf.copy_to_slice(&mut raw);
        Ok(CorrelationId::Compound {
            origin: Uuid::from_bytes(raw),
            sequence: buf.get_i64(),
        })
    } else {
        need(buf, 8)?;
        Ok(CorrelationId::Numeric(buf.get_i64()))
    }
}

fn put_payload(
    buf: &mut BytesMut,
    version: ProtocolVersion,
    payload: &Bytes,
) -> Result<(), ProtocolError> {
    if version.quirks().contains(Quirks::NARROW_PAYLOAD_LENGTH) {
        let len = u16::try_from(payload.len()).map_err(|_| ProtocolError::PayloadTooLarge {
            size: payload.len(),
            version: version.get(),
        })?;
        buf.put_u16(len);
    } else {
        buf.put_u32(payload.len() as u32);
    }
    buf.put_slice(payload);
    Ok(())
}

fn get_payload(buf: &mut Bytes, version: ProtocolVersion) -> Result<Bytes, ProtocolError> {
    let len = if version.quirks().contains(Quirks::NARROW_PAYLOAD_LENGTH) {
        need(buf, 2)?;
        buf.get_u16() as usize
    } else {
        need(buf, 4)?;
        buf.get_u32() as usize
    };
    need(buf, len)?;
    Ok(buf.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: &Message, version: Option<ProtocolVersion>) -> Message {
        let encoded = message.encode(version).unwrap();
        Message::decode(encoded, version).unwrap()
    }

    #[test]
    fn test_connect_encoding() {
        let msg = Message::Connect {
            offered_versions: vec![ProtocolVersion::V3, ProtocolVersion::V2, ProtocolVersion::V1],
        };
        let encoded = msg.encode(None).unwrap();
        assert_eq!(encoded.as_ref(), &[0x01, 3, 3, 2, 1]);
        assert_eq!(roundtrip(&msg, None), msg);
    }

    #[test]
    fn test_reject_encoding() {
        let msg = Message::Reject {
            reason: RejectReason::IncompatibleVersion,
            acceptable_versions: vec![ProtocolVersion::V3, ProtocolVersion::V2],
        };
        let encoded = msg.encode(None).unwrap();
        assert_eq!(encoded.as_ref(), &[0x03, 0, 2, 3, 2]);
    }

    #[test]
    fn test_handshake_messages_are_version_independent() {
        let msg = Message::Accept {
            version: ProtocolVersion::V4,
        };
        let before = msg.encode(None).unwrap();
        let after = msg.encode(Some(ProtocolVersion::V1)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_zero_version_rejected() {
        let result = Message::decode(Bytes::from_static(&[0x02, 0]), None);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(0))));
    }

    #[test]
    fn test_suspend_requires_v2() {
        let result = Message::Suspend.encode(Some(ProtocolVersion::V1));
        assert!(matches!(
            result,
            Err(ProtocolError::MessageNotSupported { tag: "SUSPEND", version: 1 })
        ));

        let result = Message::decode(Bytes::from_static(&[0x06]), Some(ProtocolVersion::V1));
        assert!(matches!(result, Err(ProtocolError::MessageNotSupported { .. })));

        assert_eq!(
            roundtrip(&Message::Suspend, Some(ProtocolVersion::V2)),
            Message::Suspend
        );
    }

    #[test]
    fn test_start_tls_requires_v3() {
        let msg = Message::StartTlsRequest {
            requirement: TlsRequirement::Required,
        };
        assert!(msg.encode(Some(ProtocolVersion::V2)).is_err());
        assert!(msg.encode(None).is_err());
    }

    #[test]
    fn test_enums_as_strings_quirk() {
        let msg = Message::StartTlsRequest {
            requirement: TlsRequirement::Supported,
        };

        let v3 = msg.encode(Some(ProtocolVersion::V3)).unwrap();
        assert_eq!(&v3[..], b"\x07\x09SUPPORTED");

        let v4 = msg.encode(Some(ProtocolVersion::V4)).unwrap();
        assert_eq!(&v4[..], &[0x07, 1]);

        assert_eq!(roundtrip(&msg, Some(ProtocolVersion::V3)), msg);
        assert_eq!(roundtrip(&msg, Some(ProtocolVersion::V4)), msg);

        let response = Message::StartTlsResponse {
            result: TlsResult::FailedNegotiation,
        };
        let v3 = response.encode(Some(ProtocolVersion::V3)).unwrap();
        assert_eq!(&v3[..], b"\x08\x12FAILED_NEGOTIATION");
    }

    #[test]
    fn test_unknown_string_enum_rejected() {
        let result = Message::decode(
            Bytes::from_static(b"\x07\x05MAYBE"),
            Some(ProtocolVersion::V3),
        );
        assert!(matches!(result, Err(ProtocolError::InvalidEnum { .. })));
    }

    #[test]
    fn test_narrow_payload_quirk() {
        let msg = Message::Event {
            payload: Bytes::from_static(b"hi"),
        };
        let v1 = msg.encode(Some(ProtocolVersion::V1)).unwrap();
        assert_eq!(&v1[..], &[0x12, 0, 2, b'h', b'i']);
        let v2 = msg.encode(Some(ProtocolVersion::V2)).unwrap();
        assert_eq!(&v2[..], &[0x12, 0, 0, 0, 2, b'h', b'i']);

        let big = Message::Event {
            payload: Bytes::from(vec![0u8; 70_000]),
        };
        assert!(matches!(
            big.encode(Some(ProtocolVersion::V1)),
            Err(ProtocolError::PayloadTooLarge { version: 1, .. })
        ));
        assert!(big.encode(Some(ProtocolVersion::V2)).is_ok());
    }

    #[test]
    fn test_time_constraint_only_on_v4_plus() {
        let request = Message::Request(Request {
            correlation_id: CorrelationId::Numeric(7),
            time_constraint: Some(Duration::from_millis(1500)),
            payload: Bytes::from_static(b"x"),
        });

        match roundtrip(&request, Some(ProtocolVersion::V4)) {
            Message::Request(r) => {
                assert_eq!(r.time_constraint, Some(Duration::from_millis(1500)))
            }
            other => panic!("unexpected {:?}", other),
        }

        match roundtrip(&request, Some(ProtocolVersion::V3)) {
            Message::Request(r) => {
                assert_eq!(r.time_constraint, None);
                assert_eq!(r.correlation_id, CorrelationId::Numeric(7));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_compound_ids_on_v5() {
        let origin = Uuid::new_v4();
        let response = Message::Response(Response {
            correlation_id: CorrelationId::Compound {
                origin,
                sequence: 42,
            },
            payload: Bytes::from_static(b"ok"),
        });
        assert_eq!(roundtrip(&response, Some(ProtocolVersion::V5)), response);

        // Numeric ids cannot travel on v5, compound ids cannot travel below it
        let numeric = Message::Response(Response {
            correlation_id: CorrelationId::Numeric(42),
            payload: Bytes::new(),
        });
        assert!(matches!(
            numeric.encode(Some(ProtocolVersion::V5)),
            Err(ProtocolError::CorrelationIdMismatch(5))
        ));
        assert!(matches!(
            response.encode(Some(ProtocolVersion::V4)),
            Err(ProtocolError::CorrelationIdMismatch(4))
        ));
    }

    #[test]
    fn test_request_requires_version() {
        let result = Message::decode(Bytes::from_static(&[0x10, 0, 0]), None);
        assert!(matches!(result, Err(ProtocolError::VersionRequired("REQUEST"))));
    }

    #[test]
    fn test_truncated_and_trailing() {
        let result = Message::decode(Bytes::from_static(&[0x01, 3, 1]), None);
        assert!(matches!(result, Err(ProtocolError::Truncated { needed: 2 })));

        let result = Message::decode(Bytes::from_static(&[0x04, 0xff]), Some(ProtocolVersion::V1));
        assert!(matches!(result, Err(ProtocolError::TrailingBytes(1))));

        let result = Message::decode(Bytes::new(), None);
        assert!(matches!(result, Err(ProtocolError::Truncated { needed: 1 })));
    }

    #[test]
    fn test_unknown_tag() {
        let result = Message::decode(Bytes::from_static(&[0x7f]), None);
        assert!(matches!(result, Err(ProtocolError::UnknownTag(0x7f))));
    }

    #[test]
    fn test_tag_display() {
        assert_eq!(MessageTag::StartTlsResponse.to_string(), "START_TLS_RESPONSE");
        assert_eq!(RejectReason::ServerUnavailable.to_string(), "SERVER_UNAVAILABLE");
        assert_eq!(TlsRequirement::Required.to_string(), "REQUIRED");
        assert_eq!(TlsResult::Ssl.to_string(), "SSL");
    }

    proptest::proptest! {
        #[test]
        fn prop_decode_never_panics(
            data in proptest::collection::vec(proptest::num::u8::ANY, 0..64),
            version in 0u8..7,
        ) {
            let version = ProtocolVersion::new(version);
            let _ = Message::decode(Bytes::from(data), version);
        }

        #[test]
        fn prop_event_roundtrip_every_version(
            payload in proptest::collection::vec(proptest::num::u8::ANY, 0..512),
            version in 1u8..=5,
        ) {
            let version = ProtocolVersion::new(version);
            let msg = Message::Event { payload: Bytes::from(payload) };
            let decoded = Message::decode(msg.encode(version).unwrap(), version).unwrap();
            proptest::prop_assert_eq!(decoded, msg);
        }
    }
}
