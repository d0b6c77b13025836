// ── Progress reporting ──
//
// Long-running operations narrate what they are doing through a
// `Progress` handle. The caller drains the paired `ProgressStream`; the
// core never reads events back.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::model::{ProgressEvent, ProgressKind};

/// Emitting side of one operation attempt's event stream.
///
/// Clones share the same stream. Once a `Fail` event has been emitted the
/// attempt is over and every later event is dropped.
#[derive(Debug, Clone)]
pub struct Progress {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
    terminated: Arc<AtomicBool>,
}

impl Progress {
    /// Create a progress handle and the stream its events arrive on.
    pub fn channel() -> (Self, ProgressStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let progress = Self {
            tx: Some(tx),
            terminated: Arc::new(AtomicBool::new(false)),
        };
        let stream = ProgressStream {
            inner: UnboundedReceiverStream::new(rx),
        };
        (progress, stream)
    }

    /// A handle that discards everything.
    pub fn silent() -> Self {
        Self {
            tx: None,
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn running(&self, message: impl Into<String>) {
        self.emit(ProgressKind::Running, message.into());
    }

    pub fn done(&self, message: impl Into<String>) {
        self.emit(ProgressKind::Done, message.into());
    }

    pub fn fail(&self, message: impl Into<String>) {
        self.emit(ProgressKind::Fail, message.into());
    }

    /// Whether a `Fail` event has closed this attempt.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn emit(&self, kind: ProgressKind, message: String) {
        if kind == ProgressKind::Fail {
            if self.terminated.swap(true, Ordering::AcqRel) {
                tracing::trace!(%message, "progress already failed, dropping event");
                return;
            }
        } else if self.is_terminated() {
            tracing::trace!(%message, "progress already failed, dropping event");
            return;
        }

        if let Some(ref tx) = self.tx {
            // A dropped receiver just means nobody is watching.
            let _ = tx.send(ProgressEvent::new(kind, message));
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::silent()
    }
}

/// Receiving side of a [`Progress`] channel.
///
/// Ends once every `Progress` clone has been dropped.
pub struct ProgressStream {
    inner: UnboundedReceiverStream<ProgressEvent>,
}

impl ProgressStream {
    /// Take every event emitted so far without waiting.
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        let rx = self.inner.as_mut();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
