use std::{
    io,
    path::PathBuf,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{ready, Stream, StreamExt};
use tokio::{net::UnixStream, signal::unix::SignalKind};
use tokio_stream::wrappers::{SignalStream, UnixListenerStream};

use super::StoppableStream;

/// A Trigger is anything that can trigger an upgrade or shutdown in TokioMoult. Socket
/// triggers listen through the registry, so they are handed over like any other listener.
pub(crate) enum Trigger {
    Signal(SignalKind, SignalStream),
    Uds(PathBuf, StoppableStream<UnixListenerStream>),
}

/// Holds something to identify the trigger that was triggered as well as state that should be
/// maintained between upgrader state transitions.
#[derive(Debug)]
pub(crate) enum TriggerReason {
    Signal(SignalKind),
    UnixStream(PathBuf, UnixStream),
}

impl Stream for Trigger {
    type Item = io::Result<TriggerReason>;

    /// Never yields `None`: a trigger that can no longer fire yields an error instead.
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut() {
            Self::Signal(kind, signal_stream) => match ready!(signal_stream.poll_next_unpin(cx)) {
                None => Poll::Ready(Some(Err(io::Error::other(
                    "Signal stream ended unexpectedly.",
                )))),
                Some(()) => Poll::Ready(Some(Ok(TriggerReason::Signal(*kind)))),
            },
            Self::Uds(path, listener_stream) => match ready!(listener_stream.poll_next_unpin(cx)) {
                None => Poll::Ready(Some(Err(io::Error::other(
                    "Socket shut down unexpectedly.",
                )))),
                Some(Err(e)) => Poll::Ready(Some(Err(io::Error::other(format!(
                    "Unexpected error accepting connection on socket: {e}"
                ))))),
                Some(Ok(stream)) => {
                    Poll::Ready(Some(Ok(TriggerReason::UnixStream(path.clone(), stream))))
                }
            },
        }
    }
}
