use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tracing::warn;

use sable_core::errors::ProviderError;
use sable_core::provider::ByteStream;
use sable_core::stream::{ChunkParser, StreamEvent};
use sable_core::turns::Turn;
use sable_core::usage::UsageInfo;

/// Sanity cap for a stream that never produces a separator. Short-lived
/// process streams fit comfortably; crossing this is fatal.
pub const DEFAULT_BUFFER_CAP: usize = 4 * 1024 * 1024;

/// Converts raw provider chunks into typed [`StreamEvent`]s and accumulates
/// usage. Partial segments are held across reads, never discarded:
/// concatenating every consumed segment plus [`StreamAdapter::leftover`]
/// reproduces the decoded input byte-for-byte.
pub struct StreamAdapter {
    parser: Box<dyn ChunkParser>,
    buffer: String,
    usage: Option<UsageInfo>,
    buffer_cap: usize,
}

impl StreamAdapter {
    pub fn new(parser: Box<dyn ChunkParser>) -> Self {
        Self {
            parser,
            buffer: String::new(),
            usage: None,
            buffer_cap: DEFAULT_BUFFER_CAP,
        }
    }

    pub fn with_buffer_cap(mut self, cap: usize) -> Self {
        self.buffer_cap = cap;
        self
    }

    /// Feed one raw chunk. Decode failures are logged and the chunk is
    /// skipped; only a buffer overflow ends the stream.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>, ProviderError> {
        let text = match self.parser.decode_chunk(chunk) {
            Ok(Some(text)) => text,
            Ok(None) => return Ok(Vec::new()),
            Err(e) => {
                warn!(error = %e, len = chunk.len(), "dropping undecodable chunk");
                return Ok(Vec::new());
            }
        };

        self.buffer.push_str(&text);
        if self.buffer.len() > self.buffer_cap {
            return Err(ProviderError::BufferOverflow { limit: self.buffer_cap });
        }

        let separator = self.parser.separator().to_string();
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find(&separator) {
            let segment: String = self.buffer.drain(..pos + separator.len()).collect();
            events.extend(self.consume_segment(&segment));
        }
        Ok(events)
    }

    /// Flush the trailing segment at stream end.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let segment = std::mem::take(&mut self.buffer);
        self.consume_segment(&segment)
    }

    fn consume_segment(&mut self, segment: &str) -> Vec<StreamEvent> {
        if let Some(update) = self.parser.parse_usage(segment) {
            self.usage = Some(UsageInfo::merge(self.usage.take(), &update));
        }
        match self.parser.convert_segment(segment) {
            Some(converted) => self.parser.parse_segment(&converted),
            None => self.parser.parse_segment(segment),
        }
    }

    /// Latest accumulated usage snapshot.
    pub fn usage(&self) -> Option<&UsageInfo> {
        self.usage.as_ref()
    }

    /// The retained incomplete segment.
    pub fn leftover(&self) -> &str {
        &self.buffer
    }
}

/// Async wrapper driving a [`ByteStream`] through a [`StreamAdapter`].
/// Yields events in source chunk order; an optional idle timeout turns a
/// stalled stream into a `StreamInterrupted` error event.
pub struct AdapterStream {
    inner: ByteStream,
    adapter: StreamAdapter,
    pending: VecDeque<StreamEvent>,
    idle: Option<(Pin<Box<tokio::time::Sleep>>, Duration)>,
    done: bool,
}

impl AdapterStream {
    pub fn new(inner: ByteStream, adapter: StreamAdapter) -> Self {
        Self {
            inner,
            adapter,
            pending: VecDeque::new(),
            idle: None,
            done: false,
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle = Some((Box::pin(tokio::time::sleep(timeout)), timeout));
        self
    }

    pub fn usage(&self) -> Option<&UsageInfo> {
        self.adapter.usage()
    }
}

impl Stream for AdapterStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    if let Some((sleep, timeout)) = this.idle.as_mut() {
                        sleep.as_mut().reset(tokio::time::Instant::now() + *timeout);
                    }
                    match this.adapter.push(&bytes) {
                        Ok(events) => this.pending.extend(events),
                        Err(error) => {
                            this.done = true;
                            this.pending.push_back(StreamEvent::Error { error });
                        }
                    }
                }
                Poll::Ready(Some(Err(error))) => {
                    this.done = true;
                    this.pending.push_back(StreamEvent::Error { error });
                }
                Poll::Ready(None) => {
                    this.done = true;
                    let events = this.adapter.finish();
                    this.pending.extend(events);
                }
                Poll::Pending => {
                    if let Some((sleep, timeout)) = this.idle.as_mut() {
                        if sleep.as_mut().poll(cx).is_ready() {
                            this.done = true;
                            return Poll::Ready(Some(StreamEvent::Error {
                                error: ProviderError::StreamInterrupted(format!(
                                    "no data for {}s",
                                    timeout.as_secs()
                                )),
                            }));
                        }
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

/// Drive a stream to completion and return the final assistant turn plus
/// accumulated usage. Used where increments are uninteresting.
pub async fn collect_turn(
    mut stream: AdapterStream,
) -> Result<(Turn, Option<UsageInfo>), ProviderError> {
    let mut finished: Option<Turn> = None;
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Finish { turn, .. } => finished = Some(turn),
            StreamEvent::Error { error } => return Err(error),
            _ => {}
        }
    }
    let usage = stream.usage().cloned();
    match finished {
        Some(turn) => Ok((turn, usage)),
        None => Err(ProviderError::StreamInterrupted(
            "stream ended without a finish event".into(),
        )),
    }
}
