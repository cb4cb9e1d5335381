//! Wire protocol types for dispatcher-worker communication.
//!
//! Every message is a multipart envelope:
//!
//! ```text
//! [routing_token][correlation_id][kind][body...]
//! ```
//!
//! - **job**: `[payload]`
//! - **fragment**: `[n: u32 BE][m: u32 BE][payload]`
//! - **failure**: `[failure kind][message]`

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;

/// Upper bound on `m` for a single job. Keeps reassembly buffers bounded.
pub const MAX_FRAGMENT_COUNT: u32 = 65_536;

/// Unique identifier for one client job, end to end.
///
/// UUID v4 so that ids are never reused across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque return address carried through the job so replies can be matched
/// back to the session that dispatched it. Not a network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingToken(Bytes);

impl RoutingToken {
    pub fn new() -> Self {
        Self(Bytes::copy_from_slice(uuid::Uuid::new_v4().as_bytes()))
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for RoutingToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoutingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// One framed message on the wire: an ordered list of byte parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Multipart(Vec<Bytes>);

impl Multipart {
    pub fn new(parts: Vec<Bytes>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[Bytes] {
        &self.0
    }

    pub fn into_parts(self) -> Vec<Bytes> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Bytes>> for Multipart {
    fn from(parts: Vec<Bytes>) -> Self {
        Self(parts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Job,
    Fragment,
    Failure,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Fragment => "fragment",
            Self::Failure => "failure",
        }
    }

    fn parse(raw: &[u8]) -> Option<Self> {
        match raw {
            b"job" => Some(Self::Job),
            b"fragment" => Some(Self::Fragment),
            b"failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One numbered piece (`n` of `m`) of a streamed result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub index: u32,
    pub count: u32,
    pub payload: Bytes,
}

impl Fragment {
    pub fn new(index: u32, count: u32, payload: impl Into<Bytes>) -> Result<Self, EnvelopeError> {
        if count == 0 || count > MAX_FRAGMENT_COUNT {
            return Err(EnvelopeError::FragmentCount(count));
        }
        if index >= count {
            return Err(EnvelopeError::OutOfRange { index, count });
        }
        Ok(Self {
            index,
            count,
            payload: payload.into(),
        })
    }
}

/// Failure classes a worker can report for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BadRequest,
    NotFound,
    Unauthorized,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Internal => "internal",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "bad_request" => Some(Self::BadRequest),
            "not_found" => Some(Self::NotFound),
            "unauthorized" => Some(Self::Unauthorized),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal error for a job, routed back from the worker fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureNotice {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureNotice {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Job { payload: Bytes },
    Fragment(Fragment),
    Failure(FailureNotice),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Job { .. } => MessageKind::Job,
            Self::Fragment(_) => MessageKind::Fragment,
            Self::Failure(_) => MessageKind::Failure,
        }
    }
}

/// An addressed message: who it belongs to plus what it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub routing_token: RoutingToken,
    pub correlation_id: CorrelationId,
    pub message: Message,
}

impl Envelope {
    pub fn job(routing_token: RoutingToken, correlation_id: CorrelationId, payload: Bytes) -> Self {
        Self {
            routing_token,
            correlation_id,
            message: Message::Job { payload },
        }
    }

    pub fn fragment(
        routing_token: RoutingToken,
        correlation_id: CorrelationId,
        fragment: Fragment,
    ) -> Self {
        Self {
            routing_token,
            correlation_id,
            message: Message::Fragment(fragment),
        }
    }

    pub fn failure(
        routing_token: RoutingToken,
        correlation_id: CorrelationId,
        notice: FailureNotice,
    ) -> Self {
        Self {
            routing_token,
            correlation_id,
            message: Message::Failure(notice),
        }
    }

    pub fn into_multipart(self) -> Multipart {
        let mut parts = vec![
            self.routing_token.0,
            Bytes::from(self.correlation_id.0),
            Bytes::from_static(self.message.kind().as_str().as_bytes()),
        ];
        match self.message {
            Message::Job { payload } => parts.push(payload),
            Message::Fragment(fragment) => {
                parts.push(Bytes::copy_from_slice(&fragment.index.to_be_bytes()));
                parts.push(Bytes::copy_from_slice(&fragment.count.to_be_bytes()));
                parts.push(fragment.payload);
            }
            Message::Failure(notice) => {
                parts.push(Bytes::from_static(notice.kind.as_str().as_bytes()));
                parts.push(Bytes::from(notice.message));
            }
        }
        Multipart(parts)
    }
}

impl TryFrom<Multipart> for Envelope {
    type Error = EnvelopeError;

    fn try_from(multipart: Multipart) -> Result<Self, Self::Error> {
        let mut parts = multipart.0.into_iter();
        let (Some(token), Some(id), Some(kind)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(EnvelopeError::TooShort);
        };
        let body: Vec<Bytes> = parts.collect();

        let routing_token = RoutingToken(token);
        let correlation_id = std::str::from_utf8(&id)
            .ok()
            .filter(|s| !s.is_empty())
            .map(CorrelationId::from)
            .ok_or(EnvelopeError::CorrelationId)?;
        let kind = MessageKind::parse(&kind)
            .ok_or_else(|| EnvelopeError::UnknownKind(String::from_utf8_lossy(&kind).into()))?;

        let message = match (kind, body.as_slice()) {
            (MessageKind::Job, [payload]) => Message::Job {
                payload: payload.clone(),
            },
            (MessageKind::Fragment, [index, count, payload]) => {
                let index = decode_u32("fragment index", index)?;
                let count = decode_u32("fragment count", count)?;
                Message::Fragment(Fragment::new(index, count, payload.clone())?)
            }
            (MessageKind::Failure, [failure_kind, message]) => {
                let failure_kind = std::str::from_utf8(failure_kind)
                    .map_err(|_| EnvelopeError::Utf8("failure kind"))?;
                let failure_kind = FailureKind::parse(failure_kind)
                    .ok_or_else(|| EnvelopeError::UnknownFailureKind(failure_kind.to_string()))?;
                let message = std::str::from_utf8(message)
                    .map_err(|_| EnvelopeError::Utf8("failure message"))?;
                Message::Failure(FailureNotice::new(failure_kind, message))
            }
            (kind, body) => {
                return Err(EnvelopeError::BodyParts {
                    kind,
                    actual: body.len(),
                });
            }
        };

        Ok(Self {
            routing_token,
            correlation_id,
            message,
        })
    }
}

fn decode_u32(field: &'static str, raw: &[u8]) -> Result<u32, EnvelopeError> {
    let bytes: [u8; 4] = raw.try_into().map_err(|_| EnvelopeError::Integer {
        field,
        len: raw.len(),
    })?;
    Ok(u32::from_be_bytes(bytes))
}

/// Decode failure for an inbound message. Never attributed to a session.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope needs at least routing token, correlation id and kind")]
    TooShort,
    #[error("correlation id is empty or not valid UTF-8")]
    CorrelationId,
    #[error("unknown message kind {0:?}")]
    UnknownKind(String),
    #[error("{kind} envelope has wrong number of body parts ({actual})")]
    BodyParts { kind: MessageKind, actual: usize },
    #[error("{field} must be 4 bytes, got {len}")]
    Integer { field: &'static str, len: usize },
    #[error("fragment count {0} outside 1..={max}", max = MAX_FRAGMENT_COUNT)]
    FragmentCount(u32),
    #[error("fragment index {index} out of range for count {count}")]
    OutOfRange { index: u32, count: u32 },
    #[error("{0} is not valid UTF-8")]
    Utf8(&'static str),
    #[error("unknown failure kind {0:?}")]
    UnknownFailureKind(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_token() -> RoutingToken {
        RoutingToken::from_bytes(&b"reply-to"[..])
    }

    fn test_id() -> CorrelationId {
        CorrelationId::from("550e8400-e29b-41d4-a716-446655440000")
    }

    fn parts(raw: &[&[u8]]) -> Multipart {
        Multipart::new(raw.iter().map(|p| Bytes::copy_from_slice(p)).collect())
    }

    #[test]
    fn correlation_ids_are_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn routing_token_displays_as_hex() {
        let token = RoutingToken::from_bytes(vec![0x00, 0xab, 0x10]);
        assert_eq!(token.to_string(), "00ab10");
    }

    #[test]
    fn job_envelope_layout() {
        let envelope = Envelope::job(test_token(), test_id(), Bytes::from_static(b"query"));
        let multipart = envelope.into_multipart();

        assert_eq!(
            multipart,
            parts(&[
                b"reply-to",
                b"550e8400-e29b-41d4-a716-446655440000",
                b"job",
                b"query"
            ])
        );
    }

    #[test]
    fn fragment_envelope_layout() {
        let fragment = Fragment::new(1, 3, Bytes::from_static(b"tile")).unwrap();
        let multipart = Envelope::fragment(test_token(), test_id(), fragment).into_multipart();

        assert_eq!(multipart.len(), 6);
        assert_eq!(&multipart.parts()[2][..], b"fragment");
        assert_eq!(&multipart.parts()[3][..], &[0, 0, 0, 1]);
        assert_eq!(&multipart.parts()[4][..], &[0, 0, 0, 3]);
        assert_eq!(&multipart.parts()[5][..], b"tile");
    }

    #[test]
    fn failure_envelope_decodes() {
        let multipart = parts(&[
            b"reply-to",
            b"pid-1",
            b"failure",
            b"not_found",
            b"no such cube",
        ]);
        let envelope = Envelope::try_from(multipart).unwrap();

        assert_eq!(envelope.correlation_id.as_str(), "pid-1");
        assert_eq!(
            envelope.message,
            Message::Failure(FailureNotice::new(FailureKind::NotFound, "no such cube"))
        );
    }

    #[test]
    fn fragment_envelope_decodes() {
        let multipart = parts(&[
            b"reply-to",
            b"pid-1",
            b"fragment",
            &[0, 0, 0, 2],
            &[0, 0, 0, 3],
            b"payload",
        ]);
        let envelope = Envelope::try_from(multipart).unwrap();

        match envelope.message {
            Message::Fragment(fragment) => {
                assert_eq!(fragment.index, 2);
                assert_eq!(fragment.count, 3);
                assert_eq!(&fragment.payload[..], b"payload");
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn too_few_parts_rejected() {
        let err = Envelope::try_from(parts(&[b"reply-to", b"pid-1"])).unwrap_err();
        assert_eq!(err, EnvelopeError::TooShort);
    }

    #[test]
    fn empty_correlation_id_rejected() {
        let err = Envelope::try_from(parts(&[b"t", b"", b"job", b"x"])).unwrap_err();
        assert_eq!(err, EnvelopeError::CorrelationId);
    }

    #[test]
    fn unknown_kind_rejected() {
        let err = Envelope::try_from(parts(&[b"t", b"pid", b"partial", b"x"])).unwrap_err();
        assert_eq!(err, EnvelopeError::UnknownKind("partial".to_string()));
    }

    #[test]
    fn out_of_range_fragment_rejected() {
        let multipart = parts(&[
            b"t",
            b"pid",
            b"fragment",
            &[0, 0, 0, 3],
            &[0, 0, 0, 3],
            b"x",
        ]);
        let err = Envelope::try_from(multipart).unwrap_err();
        assert_eq!(err, EnvelopeError::OutOfRange { index: 3, count: 3 });
    }

    #[test]
    fn short_integer_rejected() {
        let multipart = parts(&[b"t", b"pid", b"fragment", &[1], &[0, 0, 0, 3], b"x"]);
        let err = Envelope::try_from(multipart).unwrap_err();
        assert_eq!(
            err,
            EnvelopeError::Integer {
                field: "fragment index",
                len: 1
            }
        );
    }

    #[test]
    fn wrong_body_arity_rejected() {
        let err = Envelope::try_from(parts(&[b"t", b"pid", b"job"])).unwrap_err();
        assert_eq!(
            err,
            EnvelopeError::BodyParts {
                kind: MessageKind::Job,
                actual: 0
            }
        );
    }

    #[test]
    fn unknown_failure_kind_rejected() {
        let multipart = parts(&[b"t", b"pid", b"failure", b"teapot", b"short and stout"]);
        let err = Envelope::try_from(multipart).unwrap_err();
        assert_eq!(err, EnvelopeError::UnknownFailureKind("teapot".to_string()));
    }

    #[test]
    fn zero_fragment_count_rejected() {
        assert_eq!(
            Fragment::new(0, 0, Bytes::new()).unwrap_err(),
            EnvelopeError::FragmentCount(0)
        );
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        insta::assert_json_snapshot!(
            "failure_kind_all_variants",
            [
                FailureKind::BadRequest,
                FailureKind::NotFound,
                FailureKind::Unauthorized,
                FailureKind::Internal,
            ]
        );
    }
}
