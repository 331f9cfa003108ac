//! Wire codec for peek reply payloads.
//!
//! A payload is a header followed by version groups:
//!
//! ```text
//! payload       := magic:u32 team_id:[u8;16] version-group*
//! version-group := version:i64 num_items:u32 item{num_items}
//! item          := subsequence:u32 message
//! message       := tag:u8 body
//! ```
//!
//! All integers are little-endian. An empty version is a group with
//! `num_items == 0`; the deserializer synthesizes one `EmptyVersion` marker
//! at subsequence 0 for it when emission is enabled. Framing and subsequence
//! density are validated eagerly when a payload is loaded; iteration
//! afterwards never fails.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use spool_core::{
    Error, Message, Mutation, MutationKind, Result, StorageTeamId, Subsequence, Version,
    VersionSubsequenceMessage, INVALID_VERSION,
};

/// Magic number opening every peek payload (`"SPL1"`).
pub const PAYLOAD_MAGIC: u32 = 0x5350_4C31;

const MESSAGE_TAG_MUTATION: u8 = 0;
const MESSAGE_TAG_LOG_PROTOCOL: u8 = 1;
const MESSAGE_TAG_SPAN_CONTEXT: u8 = 2;

/// Builds a peek reply payload for one storage team.
///
/// Versions must be opened in strictly increasing order; items within a
/// version are appended with their subsequence.
#[derive(Debug)]
pub struct MessageSerializer {
    buf: BytesMut,
    open_group: Option<OpenGroup>,
    last_version: Version,
}

#[derive(Debug)]
struct OpenGroup {
    num_items_at: usize,
    items: u32,
}

impl MessageSerializer {
    /// Starts a payload for the given storage team.
    #[must_use]
    pub fn new(team: StorageTeamId) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32_le(PAYLOAD_MAGIC);
        buf.put_slice(team.as_bytes());
        Self { buf, open_group: None, last_version: INVALID_VERSION }
    }

    /// Opens a version group. Panics if `version` does not exceed the
    /// previously opened version.
    pub fn open_version(&mut self, version: Version) {
        assert!(
            version > self.last_version,
            "versions must be serialized in increasing order: {} after {}",
            version,
            self.last_version
        );
        self.close_group();
        self.last_version = version;
        self.buf.put_i64_le(version);
        let num_items_at = self.buf.len();
        self.buf.put_u32_le(0);
        self.open_group = Some(OpenGroup { num_items_at, items: 0 });
    }

    /// Records an empty version: a group that carries no items.
    pub fn empty_version(&mut self, version: Version) {
        self.open_version(version);
    }

    /// Appends one message to the open version group.
    ///
    /// Panics if no version is open or the message is the empty-version
    /// marker, which is represented structurally.
    pub fn push(&mut self, subsequence: Subsequence, message: &Message) {
        assert!(!message.is_empty_version(), "empty versions are encoded as empty groups");
        let group = self.open_group.as_mut().expect("no version group open");
        group.items += 1;
        self.buf.put_u32_le(subsequence);
        encode_message(&mut self.buf, message);
    }

    /// Finalizes the payload.
    #[must_use]
    pub fn finish(mut self) -> Bytes {
        self.close_group();
        self.buf.freeze()
    }

    fn close_group(&mut self) {
        if let Some(group) = self.open_group.take() {
            let at = group.num_items_at;
            self.buf[at..at + 4].copy_from_slice(&group.items.to_le_bytes());
        }
    }
}

fn encode_message(buf: &mut BytesMut, message: &Message) {
    match message {
        Message::Mutation(mutation) => {
            buf.put_u8(MESSAGE_TAG_MUTATION);
            buf.put_u8(mutation.kind.as_u8());
            buf.put_u32_le(mutation.key.len() as u32);
            buf.put_slice(&mutation.key);
            buf.put_u32_le(mutation.value.len() as u32);
            buf.put_slice(&mutation.value);
        }
        Message::LogProtocol { protocol_version } => {
            buf.put_u8(MESSAGE_TAG_LOG_PROTOCOL);
            buf.put_u64_le(*protocol_version);
        }
        Message::SpanContext { span_id } => {
            buf.put_u8(MESSAGE_TAG_SPAN_CONTEXT);
            buf.put_slice(span_id);
        }
        Message::EmptyVersion => unreachable!("rejected by push"),
    }
}

/// Decodes peek reply payloads into ordered message triples.
///
/// The buffered sequence survives until the next [`reset`](Self::reset);
/// [`rewind`](Self::rewind) restarts iteration over the same payload.
/// Message payload bytes are shallow slices of the reply buffer.
#[derive(Debug)]
pub struct MessageDeserializer {
    emit_empty_versions: bool,
    team: Option<StorageTeamId>,
    messages: Vec<VersionSubsequenceMessage>,
    pos: usize,
}

impl MessageDeserializer {
    /// Creates a deserializer with no buffered payload.
    ///
    /// `emit_empty_versions` controls whether empty version groups produce a
    /// synthetic `EmptyVersion` marker.
    #[must_use]
    pub fn new(emit_empty_versions: bool) -> Self {
        Self { emit_empty_versions, team: None, messages: Vec::new(), pos: 0 }
    }

    /// Replaces the buffered payload, validating framing, version order and
    /// subsequence density, and restarts iteration.
    pub fn reset(&mut self, payload: Bytes) -> Result<()> {
        let (team, messages) = decode_payload(payload, self.emit_empty_versions)?;
        self.team = Some(team);
        self.messages = messages;
        self.pos = 0;
        Ok(())
    }

    /// Restarts iteration over the buffered payload.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Returns the message at the iteration position, if any.
    #[must_use]
    pub fn peek(&self) -> Option<&VersionSubsequenceMessage> {
        self.messages.get(self.pos)
    }

    /// Advances the iteration position by one message.
    pub fn advance(&mut self) {
        if self.pos < self.messages.len() {
            self.pos += 1;
        }
    }

    /// True when the buffered payload holds no messages at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of buffered messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Storage team of the most recent payload.
    #[must_use]
    pub fn team(&self) -> Option<StorageTeamId> {
        self.team
    }

    /// Iterates the full buffered sequence, independent of the iteration
    /// position.
    pub fn iter(&self) -> std::slice::Iter<'_, VersionSubsequenceMessage> {
        self.messages.iter()
    }
}

fn decode_payload(
    mut buf: Bytes,
    emit_empty_versions: bool,
) -> Result<(StorageTeamId, Vec<VersionSubsequenceMessage>)> {
    ensure(&buf, 4 + 16, "payload header")?;
    let magic = buf.get_u32_le();
    if magic != PAYLOAD_MAGIC {
        return Err(Error::malformed(format!("bad payload magic {magic:#010x}")));
    }
    let mut team_raw = [0u8; 16];
    buf.copy_to_slice(&mut team_raw);
    let team = StorageTeamId::from_bytes(team_raw);

    let mut messages = Vec::new();
    let mut last_version = INVALID_VERSION;
    while buf.has_remaining() {
        ensure(&buf, 8 + 4, "version group header")?;
        let version = buf.get_i64_le();
        let num_items = buf.get_u32_le();
        if version <= last_version {
            return Err(Error::malformed(format!(
                "version {version} not after {last_version}"
            )));
        }
        last_version = version;

        if num_items == 0 {
            if emit_empty_versions {
                messages.push(VersionSubsequenceMessage::new(version, 0, Message::EmptyVersion));
            }
            continue;
        }

        let mut expected: Subsequence = 1;
        for _ in 0..num_items {
            ensure(&buf, 4, "subsequence")?;
            let subsequence = buf.get_u32_le();
            if subsequence != expected {
                return Err(Error::malformed(format!(
                    "subsequence gap at version {version}: got {subsequence}, expected {expected}"
                )));
            }
            expected += 1;
            let message = decode_message(&mut buf)?;
            messages.push(VersionSubsequenceMessage::new(version, subsequence, message));
        }
    }

    Ok((team, messages))
}

fn decode_message(buf: &mut Bytes) -> Result<Message> {
    ensure(buf, 1, "message tag")?;
    match buf.get_u8() {
        MESSAGE_TAG_MUTATION => {
            ensure(buf, 1, "mutation kind")?;
            let raw_kind = buf.get_u8();
            let kind = MutationKind::from_u8(raw_kind)
                .ok_or_else(|| Error::malformed(format!("unknown mutation kind {raw_kind}")))?;
            let key = decode_bytes(buf, "mutation key")?;
            let value = decode_bytes(buf, "mutation value")?;
            Ok(Message::Mutation(Mutation { kind, key, value }))
        }
        MESSAGE_TAG_LOG_PROTOCOL => {
            ensure(buf, 8, "protocol version")?;
            Ok(Message::LogProtocol { protocol_version: buf.get_u64_le() })
        }
        MESSAGE_TAG_SPAN_CONTEXT => {
            ensure(buf, 16, "span id")?;
            let mut span_id = [0u8; 16];
            buf.copy_to_slice(&mut span_id);
            Ok(Message::SpanContext { span_id })
        }
        tag => Err(Error::malformed(format!("unknown message tag {tag}"))),
    }
}

fn decode_bytes(buf: &mut Bytes, what: &str) -> Result<Bytes> {
    ensure(buf, 4, what)?;
    let len = buf.get_u32_le() as usize;
    ensure(buf, len, what)?;
    Ok(buf.copy_to_bytes(len))
}

fn ensure(buf: &Bytes, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::malformed(format!(
            "truncated payload: {what} needs {needed} bytes, {} remain",
            buf.remaining()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_team() -> StorageTeamId {
        StorageTeamId::from_bytes([7u8; 16])
    }

    fn sample_payload() -> Bytes {
        let mut serializer = MessageSerializer::new(sample_team());
        serializer.open_version(1000);
        serializer.push(1, &Message::Mutation(Mutation::set(&b"a"[..], &b"1"[..])));
        serializer.push(2, &Message::Mutation(Mutation::clear_range(&b"b"[..], &b"c"[..])));
        serializer.empty_version(1001);
        serializer.open_version(1003);
        serializer.push(1, &Message::LogProtocol { protocol_version: 9 });
        serializer.push(2, &Message::SpanContext { span_id: [3u8; 16] });
        serializer.finish()
    }

    #[test]
    fn test_roundtrip() {
        let mut deserializer = MessageDeserializer::new(true);
        deserializer.reset(sample_payload()).unwrap();

        assert_eq!(deserializer.team(), Some(sample_team()));
        let positions: Vec<_> = deserializer.iter().map(|m| m.position()).collect();
        assert_eq!(positions, vec![(1000, 1), (1000, 2), (1001, 0), (1003, 1), (1003, 2)]);
        assert!(deserializer.iter().nth(2).unwrap().message.is_empty_version());
    }

    #[test]
    fn test_empty_version_suppression() {
        let mut deserializer = MessageDeserializer::new(false);
        deserializer.reset(sample_payload()).unwrap();
        assert_eq!(deserializer.len(), 4);
        assert!(deserializer.iter().all(|m| !m.message.is_empty_version()));
    }

    #[test]
    fn test_header_only_payload_is_empty() {
        let payload = MessageSerializer::new(sample_team()).finish();
        let mut deserializer = MessageDeserializer::new(true);
        deserializer.reset(payload).unwrap();
        assert!(deserializer.is_empty());
        assert!(deserializer.peek().is_none());
    }

    #[test]
    fn test_iteration_and_rewind() {
        let mut deserializer = MessageDeserializer::new(true);
        deserializer.reset(sample_payload()).unwrap();

        let mut first = Vec::new();
        while let Some(message) = deserializer.peek() {
            first.push(message.clone());
            deserializer.advance();
        }
        assert_eq!(first.len(), 5);

        deserializer.rewind();
        let mut second = Vec::new();
        while let Some(message) = deserializer.peek() {
            second.push(message.clone());
            deserializer.advance();
        }
        assert_eq!(first, second);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut payload = BytesMut::from(&sample_payload()[..]);
        payload[0] = 0xFF;
        let mut deserializer = MessageDeserializer::new(true);
        assert!(deserializer.reset(payload.freeze()).is_err());
    }

    #[test]
    fn test_rejects_truncation() {
        let payload = sample_payload();
        let mut deserializer = MessageDeserializer::new(true);
        assert!(deserializer.reset(payload.slice(0..payload.len() - 3)).is_err());
        assert!(deserializer.reset(payload.slice(0..10)).is_err());
    }

    #[test]
    fn test_rejects_subsequence_gap() {
        let mut serializer = MessageSerializer::new(sample_team());
        serializer.open_version(5);
        serializer.push(1, &Message::LogProtocol { protocol_version: 1 });
        serializer.push(3, &Message::LogProtocol { protocol_version: 1 });
        let payload = serializer.finish();

        let mut deserializer = MessageDeserializer::new(true);
        let err = deserializer.reset(payload).unwrap_err();
        assert!(err.to_string().contains("subsequence gap"));
    }

    #[test]
    #[should_panic(expected = "increasing order")]
    fn test_serializer_rejects_version_regression() {
        let mut serializer = MessageSerializer::new(sample_team());
        serializer.open_version(10);
        serializer.open_version(10);
    }
}
