//! Length-prefixed framing.
//!
//! A frame is a 4-byte big-endian payload length followed by one CBOR encoded
//! [`Message`]. Frames announcing more than the configured maximum are
//! rejected before any payload is buffered.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::Message;
use bytes::{Buf, BufMut, BytesMut};

/// Size of the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default upper bound on a frame payload (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encodes and decodes frames on byte buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    /// Creates a codec with a payload size limit.
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Payload size limit.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Appends one frame to `dst`.
    pub fn encode(&self, message: &Message, dst: &mut BytesMut) -> ProtocolResult<()> {
        let payload = message.encode()?;
        if payload.len() > self.max_frame_len || payload.len() > u32::MAX as usize {
            return Err(ProtocolError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }
        dst.reserve(LENGTH_PREFIX_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }

    /// Takes one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn decode(&self, src: &mut BytesMut) -> ProtocolResult<Option<Message>> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let mut prefix = &src[..LENGTH_PREFIX_LEN];
        let len = prefix.get_u32() as usize;
        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if src.len() < LENGTH_PREFIX_LEN + len {
            src.reserve(LENGTH_PREFIX_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_LEN);
        let payload = src.split_to(len);
        Message::decode(&payload).map(Some)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

/// Slack for CBOR collection headers that grow as items are added.
const COLLECTION_SLACK: usize = 16;

/// Tracks how much of one frame a message under construction uses.
///
/// The cost of an item is measured by encoding the message with just that
/// item and subtracting the empty message.
#[derive(Debug, Clone)]
pub struct FrameBudget {
    limit: usize,
    empty_len: usize,
    used: usize,
}

impl FrameBudget {
    /// Starts a budget for messages shaped like `empty`.
    pub fn new(limit: usize, empty: &Message) -> ProtocolResult<Self> {
        let empty_len = empty.encode()?.len();
        Ok(Self {
            limit,
            empty_len,
            used: empty_len + COLLECTION_SLACK,
        })
    }

    /// Bytes one item adds, given the empty message with only that item.
    pub fn cost_of(&self, single: &Message) -> ProtocolResult<usize> {
        Ok(single.encode()?.len().saturating_sub(self.empty_len))
    }

    /// True if an item of `cost` does not fit even in an empty message.
    pub fn exceeds_alone(&self, cost: usize) -> bool {
        self.empty_len + COLLECTION_SLACK + cost > self.limit
    }

    /// Reserves room for an item. Returns false when it does not fit.
    pub fn try_reserve(&mut self, cost: usize) -> bool {
        if self.used + cost > self.limit {
            return false;
        }
        self.used += cost;
        true
    }

    /// True if nothing has been reserved.
    pub fn is_empty(&self) -> bool {
        self.used == self.empty_len + COLLECTION_SLACK
    }

    fn clear(&mut self) {
        self.used = self.empty_len + COLLECTION_SLACK;
    }
}

/// Items grouped so that each group, wrapped in its message, fits a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameChunks<T> {
    /// Groups in input order.
    pub chunks: Vec<Vec<T>>,
    /// Items too large to send even alone.
    pub oversized: Vec<T>,
}

/// Splits `items` into groups whose message built by `wrap` fits in
/// `max_frame_len` bytes.
pub fn chunk_to_fit<T, F>(
    items: Vec<T>,
    max_frame_len: usize,
    wrap: F,
) -> ProtocolResult<FrameChunks<T>>
where
    T: Clone,
    F: Fn(Vec<T>) -> Message,
{
    let mut budget = FrameBudget::new(max_frame_len, &wrap(Vec::new()))?;
    let mut chunks = Vec::new();
    let mut oversized = Vec::new();
    let mut current = Vec::new();
    for item in items {
        let cost = budget.cost_of(&wrap(vec![item.clone()]))?;
        if budget.exceeds_alone(cost) {
            oversized.push(item);
            continue;
        }
        if !budget.try_reserve(cost) {
            chunks.push(std::mem::take(&mut current));
            budget.clear();
            budget.try_reserve(cost);
        }
        current.push(item);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    Ok(FrameChunks { chunks, oversized })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::SubChanges;
    use proptest::prelude::*;

    fn sub(since: u64) -> Message {
        Message::SubChanges(SubChanges {
            since,
            limit: 100,
            channels: vec!["a".into()],
            doc_ids: Vec::new(),
        })
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let codec = FrameCodec::default();
        let mut full = BytesMut::new();
        codec.encode(&sub(7), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(sub(7)));
        assert!(partial.is_empty());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let codec = FrameCodec::new(8);
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(&sub(1), &mut buf),
            Err(ProtocolError::FrameTooLarge { max: 8, .. })
        ));

        let mut announced = BytesMut::new();
        announced.put_u32(1_000);
        assert!(matches!(
            codec.decode(&mut announced),
            Err(ProtocolError::FrameTooLarge { len: 1_000, .. })
        ));
    }

    #[test]
    fn chunks_fit_the_frame_and_keep_order() {
        let wrap = |doc_ids: Vec<String>| {
            Message::SubChanges(SubChanges {
                since: 0,
                limit: 1,
                channels: Vec::new(),
                doc_ids,
            })
        };
        let ids: Vec<String> = (0..50).map(|n| format!("document-{n:03}")).collect();
        let fitted = chunk_to_fit(ids.clone(), 200, wrap).unwrap();

        assert!(fitted.oversized.is_empty());
        assert!(fitted.chunks.len() > 1);
        for chunk in &fitted.chunks {
            assert!(wrap(chunk.clone()).encode().unwrap().len() <= 200);
        }
        let flat: Vec<String> = fitted.chunks.concat();
        assert_eq!(flat, ids);
    }

    #[test]
    fn items_too_big_alone_are_set_aside() {
        let wrap = |doc_ids: Vec<String>| {
            Message::SubChanges(SubChanges {
                since: 0,
                limit: 1,
                channels: Vec::new(),
                doc_ids,
            })
        };
        let items = vec!["small".to_string(), "x".repeat(500), "tiny".to_string()];
        let fitted = chunk_to_fit(items, 200, wrap).unwrap();
        assert_eq!(fitted.oversized, vec!["x".repeat(500)]);
        assert_eq!(fitted.chunks, vec![vec!["small".to_string(), "tiny".to_string()]]);
    }

    proptest! {
        #[test]
        fn split_points_do_not_matter(since in any::<u64>(), cut in 0usize..64) {
            let codec = FrameCodec::default();
            let mut full = BytesMut::new();
            codec.encode(&sub(since), &mut full).unwrap();
            let cut = cut.min(full.len());

            let mut buf = BytesMut::from(&full[..cut]);
            let early = codec.decode(&mut buf).unwrap();
            if cut < full.len() {
                prop_assert_eq!(early, None);
                buf.extend_from_slice(&full[cut..]);
                prop_assert_eq!(codec.decode(&mut buf).unwrap(), Some(sub(since)));
            } else {
                prop_assert_eq!(early, Some(sub(since)));
            }
        }
    }
}
