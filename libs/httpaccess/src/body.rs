//! Outgoing request bodies
//!
//! Buffered bodies are replayed when a 307/308 redirect asks for it. Bodies
//! streamed from temporary files are sent once; a 307/308 answer to them is
//! returned as-is.

use crate::error::BoxError;
use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use http_body::{Body, Frame, SizeHint};
use http_body_util::Full;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio_util::io::ReaderStream;

/// Body of a request sent through the pooled client
#[derive(Debug)]
pub struct OutgoingBody {
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    Buffered(Full<Bytes>),
    Streamed(Segments),
}

impl OutgoingBody {
    #[must_use]
    pub fn empty() -> Self {
        Self::buffered(Bytes::new())
    }

    #[must_use]
    pub fn buffered(bytes: impl Into<Bytes>) -> Self {
        Self {
            kind: Kind::Buffered(Full::new(bytes.into())),
        }
    }

    /// A copy for replaying the request, when the body is buffered
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> {
        match &self.kind {
            Kind::Buffered(full) => Some(Self {
                kind: Kind::Buffered(full.clone()),
            }),
            Kind::Streamed(_) => None,
        }
    }

    /// Whether the body is read from files while it is sent
    #[must_use]
    pub fn is_streamed(&self) -> bool {
        matches!(self.kind, Kind::Streamed(_))
    }
}

impl Default for OutgoingBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for OutgoingBody {
    fn from(bytes: Bytes) -> Self {
        Self::buffered(bytes)
    }
}

impl Body for OutgoingBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        match &mut self.get_mut().kind {
            Kind::Buffered(full) => Pin::new(full)
                .poll_frame(cx)
                .map_err(|never| match never {}),
            Kind::Streamed(segments) => segments.poll_next_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Buffered(full) => full.is_end_stream(),
            Kind::Streamed(segments) => segments.parts.is_empty(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            Kind::Buffered(full) => full.size_hint(),
            Kind::Streamed(segments) => SizeHint::with_exact(segments.remaining),
        }
    }
}

/// Builder for a body made of in-memory chunks and open files, sent in order.
#[derive(Debug, Default)]
pub struct SegmentedBody {
    segments: Segments,
}

impl SegmentedBody {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.segments.remaining += bytes.len() as u64;
        self.segments.parts.push_back(Segment::Bytes(bytes));
    }

    /// Append `len` bytes read from `file` while the body is sent
    pub fn push_file(&mut self, file: tokio::fs::File, len: u64) {
        self.segments.remaining += len;
        self.segments
            .parts
            .push_back(Segment::File(ReaderStream::new(file)));
    }

    /// Whether any segment is read from a file
    #[must_use]
    pub fn has_files(&self) -> bool {
        self.segments
            .parts
            .iter()
            .any(|part| matches!(part, Segment::File(_)))
    }

    /// The finished body; without file segments it is buffered, so it can be replayed
    #[must_use]
    pub fn finish(self) -> OutgoingBody {
        if self.has_files() {
            return OutgoingBody {
                kind: Kind::Streamed(self.segments),
            };
        }
        let capacity = usize::try_from(self.segments.remaining).unwrap_or_default();
        let mut out = BytesMut::with_capacity(capacity);
        for part in self.segments.parts {
            if let Segment::Bytes(bytes) = part {
                out.extend_from_slice(&bytes);
            }
        }
        OutgoingBody::buffered(out.freeze())
    }
}

#[derive(Debug, Default)]
struct Segments {
    parts: VecDeque<Segment>,
    remaining: u64,
}

#[derive(Debug)]
enum Segment {
    Bytes(Bytes),
    File(ReaderStream<tokio::fs::File>),
}

impl Segments {
    fn poll_next_frame(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        loop {
            let Some(front) = self.parts.front_mut() else {
                return Poll::Ready(None);
            };
            let chunk = match front {
                Segment::Bytes(bytes) => Some(std::mem::take(bytes)),
                Segment::File(stream) => match ready!(Pin::new(stream).poll_next(cx)) {
                    Some(Ok(chunk)) => Some(chunk),
                    Some(Err(e)) => return Poll::Ready(Some(Err(Box::new(e)))),
                    None => None,
                },
            };
            if matches!(front, Segment::Bytes(_)) || chunk.is_none() {
                self.parts.pop_front();
            }
            if let Some(chunk) = chunk.filter(|c| !c.is_empty()) {
                self.remaining = self.remaining.saturating_sub(chunk.len() as u64);
                return Poll::Ready(Some(Ok(Frame::data(chunk))));
            }
        }
    }
}
