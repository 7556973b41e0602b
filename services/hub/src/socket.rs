//! The `Socket` abstraction (C2): everything a connection needs from its
//! transport, named after the browser WebSocket properties the spec
//! mirrors (`readyState`, `bufferedAmount`). Boxed as `dyn Socket` so
//! tests can swap in an in-memory double without standing up a real
//! axum server. Other traits in this crate use `async_trait` for
//! convenience, but `Socket`'s methods borrow `&self` for the duration of
//! the returned future (the production impl's `Mutex` guard lives across
//! the `.await`), which `async_trait`'s desugaring can't express as
//! cleanly as a hand-written `Pin<Box<dyn Future>>` signature.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Open,
    Closing,
    Closed,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Transport seam a `Connection` sends through. Implemented by
/// [`AxumSocket`] in production and by a fake in tests.
pub trait Socket: Send + Sync {
    fn state(&self) -> SocketState;

    /// Bytes handed to `send` but not yet confirmed flushed to the OS
    /// socket buffer — an approximation of the browser `bufferedAmount`
    /// property axum's raw `WebSocket` has no equivalent for.
    fn buffered_amount(&self) -> usize;

    fn send_text<'a>(&'a self, text: String) -> BoxFuture<'a, Result<(), SocketError>>;

    fn send_ping<'a>(&'a self) -> BoxFuture<'a, Result<(), SocketError>>;

    fn close<'a>(&'a self, code: u16, reason: String) -> BoxFuture<'a, Result<(), SocketError>>;

    /// Non-graceful teardown, used when the connection is already
    /// unresponsive (heartbeat timeout) and a close handshake would just
    /// hang.
    fn terminate<'a>(&'a self) -> BoxFuture<'a, ()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketError(pub String);

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "socket error: {}", self.0)
    }
}

impl std::error::Error for SocketError {}

/// Production `Socket` wrapping axum's split WebSocket sink. The sink is
/// behind a `tokio::sync::Mutex` because `SplitSink::send` needs `&mut
/// self` while `Socket`'s methods only ever hand out `&self` — callers
/// serialize sends through `Connection`'s own lock anyway (see
/// `connection.rs`), so this lock is never contended in practice.
pub struct AxumSocket {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    buffered: AtomicUsize,
    closed: AtomicBool,
}

impl AxumSocket {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Arc<Self> {
        Arc::new(Self { sink: Mutex::new(sink), buffered: AtomicUsize::new(0), closed: AtomicBool::new(false) })
    }
}

impl Socket for AxumSocket {
    fn state(&self) -> SocketState {
        if self.closed.load(Ordering::Acquire) {
            SocketState::Closed
        } else {
            SocketState::Open
        }
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    fn send_text<'a>(&'a self, text: String) -> BoxFuture<'a, Result<(), SocketError>> {
        Box::pin(async move {
            let len = text.len();
            self.buffered.fetch_add(len, Ordering::AcqRel);
            let mut sink = self.sink.lock().await;
            let result = sink.send(Message::Text(text)).await;
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            result.map_err(|e| SocketError(e.to_string()))
        })
    }

    fn send_ping<'a>(&'a self) -> BoxFuture<'a, Result<(), SocketError>> {
        Box::pin(async move {
            let mut sink = self.sink.lock().await;
            sink.send(Message::Ping(Vec::new())).await.map_err(|e| SocketError(e.to_string()))
        })
    }

    fn close<'a>(&'a self, code: u16, reason: String) -> BoxFuture<'a, Result<(), SocketError>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            let mut sink = self.sink.lock().await;
            let frame = axum::extract::ws::CloseFrame { code, reason: reason.into() };
            sink.send(Message::Close(Some(frame))).await.map_err(|e| SocketError(e.to_string()))
        })
    }

    fn terminate<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            let mut sink = self.sink.lock().await;
            let _ = sink.close().await;
        })
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::{BoxFuture, Socket, SocketError, SocketState};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// In-memory `Socket` double: records every text frame sent and every
    /// close, with no real I/O, so unit tests can assert on what a
    /// connection would have written to the wire.
    #[derive(Default)]
    pub struct FakeSocket {
        pub sent: StdMutex<Vec<String>>,
        pub closed_with: StdMutex<Option<(u16, String)>>,
        pub fail_next_send: std::sync::atomic::AtomicBool,
        fake_buffered: AtomicUsize,
    }

    impl FakeSocket {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_buffered_amount(&self, n: usize) {
            self.fake_buffered.store(n, Ordering::Release);
        }

        pub fn sent_frames(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Socket for FakeSocket {
        fn state(&self) -> SocketState {
            if self.closed_with.lock().unwrap().is_some() {
                SocketState::Closed
            } else {
                SocketState::Open
            }
        }

        fn buffered_amount(&self) -> usize {
            self.fake_buffered.load(Ordering::Acquire)
        }

        fn send_text<'a>(&'a self, text: String) -> BoxFuture<'a, Result<(), SocketError>> {
            Box::pin(async move {
                if self.fail_next_send.swap(false, Ordering::AcqRel) {
                    return Err(SocketError("forced failure".to_owned()));
                }
                self.sent.lock().unwrap().push(text);
                Ok(())
            })
        }

        fn send_ping<'a>(&'a self) -> BoxFuture<'a, Result<(), SocketError>> {
            Box::pin(async move { Ok(()) })
        }

        fn close<'a>(&'a self, code: u16, reason: String) -> BoxFuture<'a, Result<(), SocketError>> {
            Box::pin(async move {
                *self.closed_with.lock().unwrap() = Some((code, reason));
                Ok(())
            })
        }

        fn terminate<'a>(&'a self) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                let mut guard = self.closed_with.lock().unwrap();
                if guard.is_none() {
                    *guard = Some((1006, "terminated".to_owned()));
                }
            })
        }
    }
}
