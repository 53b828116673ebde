use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use super::codec::{Codec, Message};
use super::proto::{CloseCode, CloseReason};
use crate::{
    error::Error,
    stream::{Reader, Writer},
};

/// Connection lifecycle of a websocket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WsState {
    /// Handshake in flight.
    Connecting,
    Open,
    /// We sent a close frame and are waiting for the peer's echo.
    Closing,
    Closed,
}

/// A websocket owning its connection after a successful upgrade.
///
/// Cheap to clone; clones share the same underlying session.
#[derive(Clone)]
pub struct WebSocket {
    inner: Rc<Inner>,
}

struct Inner {
    reader: Rc<Mutex<Reader>>,
    writer: Rc<Mutex<Writer>>,
    // fragmentation state is per direction, so decode and encode each get
    // their own codec.
    decoder: RefCell<Codec>,
    encoder: RefCell<Codec>,
    buf: RefCell<BytesMut>,
    state: Cell<WsState>,
    subprotocol: Option<String>,
    extensions: Option<String>,
    last_pong: Cell<Instant>,
    last_ping: Cell<Option<Instant>>,
    ping_interval: Duration,
    pong_timeout: Duration,
}

impl WebSocket {
    pub(crate) fn new(
        reader: Rc<Mutex<Reader>>,
        writer: Rc<Mutex<Writer>>,
        subprotocol: Option<String>,
        extensions: Option<String>,
        ping_interval: Duration,
        pong_timeout: Duration,
    ) -> Self {
        Self {
            inner: Rc::new(Inner {
                reader,
                writer,
                decoder: RefCell::new(Codec::new()),
                encoder: RefCell::new(Codec::new()),
                buf: RefCell::new(BytesMut::new()),
                state: Cell::new(WsState::Open),
                subprotocol,
                extensions,
                last_pong: Cell::new(Instant::now()),
                last_ping: Cell::new(None),
                ping_interval,
                pong_timeout,
            }),
        }
    }

    pub fn state(&self) -> WsState {
        self.inner.state.get()
    }

    /// Negotiated subprotocol, if the handshake echoed one.
    pub fn subprotocol(&self) -> Option<&str> {
        self.inner.subprotocol.as_deref()
    }

    /// Negotiated extensions, if the handshake echoed any.
    pub fn extensions(&self) -> Option<&str> {
        self.inner.extensions.as_deref()
    }

    /// Receive the next data message.
    ///
    /// Control frames are consumed on the way: pings are answered with a
    /// pong carrying the same payload, pongs refresh the keep-alive clock.
    /// A close from the peer is echoed (when we did not initiate) and
    /// returned as [Message::Close]; in the closing state every non close
    /// message is dropped. Frame level violations close the socket with
    /// 1002 and surface as errors.
    pub async fn receive(&self, timeout: Option<Duration>) -> Result<Message, Error> {
        loop {
            if self.state() == WsState::Closed {
                return Err(Error::Closed);
            }

            let decoded = {
                let mut buf = self.inner.buf.borrow_mut();
                self.inner.decoder.borrow_mut().decode(&mut buf)
            };

            let message = match decoded {
                Ok(Some(message)) => message,
                Ok(None) => {
                    // need more bytes off the wire.
                    let mut reader = self.inner.reader.lock().await;
                    match reader.read(65_536, timeout).await {
                        Ok(bytes) => {
                            self.inner.buf.borrow_mut().extend_from_slice(&bytes);
                            continue;
                        }
                        Err(Error::PartialRead(_)) => {
                            // peer went away without a close frame.
                            self.inner.state.set(WsState::Closed);
                            return Err(Error::Closed);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => {
                    debug!("websocket protocol violation: {e}");
                    let _ = self.send(Message::Close(Some(CloseCode::Protocol.into()))).await;
                    self.inner.state.set(WsState::Closed);
                    return Err(e.into());
                }
            };

            match message {
                Message::Ping(payload) => {
                    self.inner.last_pong.set(Instant::now());
                    if self.state() == WsState::Open {
                        self.send(Message::Pong(payload)).await?;
                    }
                }
                Message::Pong(_) => self.inner.last_pong.set(Instant::now()),
                Message::Close(reason) => {
                    if self.state() == WsState::Open {
                        // peer initiated: echo before reporting.
                        let _ = self.send(Message::Close(reason.clone())).await;
                    }
                    self.inner.state.set(WsState::Closed);
                    return Ok(Message::Close(reason));
                }
                message => {
                    if self.state() == WsState::Closing {
                        // only a close frame is interesting anymore.
                        continue;
                    }
                    return Ok(message);
                }
            }
        }
    }

    /// Send a message. In the closing state only close frames pass.
    pub async fn send(&self, message: Message) -> Result<(), Error> {
        match self.state() {
            WsState::Closed => return Err(Error::Closed),
            WsState::Closing if !matches!(message, Message::Close(_)) => return Err(Error::Closed),
            _ => {}
        }

        let mut buf = BytesMut::new();
        self.inner.encoder.borrow_mut().encode(message, &mut buf)?;

        let mut writer = self.inner.writer.lock().await;
        if writer.write(&buf, true, None).await.is_err() {
            self.inner.state.set(WsState::Closed);
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), Error> {
        self.send(Message::Text(Bytes::from(text.into()))).await
    }

    pub async fn send_binary(&self, payload: impl Into<Bytes>) -> Result<(), Error> {
        self.send(Message::Binary(payload.into())).await
    }

    pub async fn ping(&self, payload: impl Into<Bytes>) -> Result<(), Error> {
        self.inner.last_ping.set(Some(Instant::now()));
        self.send(Message::Ping(payload.into())).await
    }

    /// Initiate the closing handshake. The socket stays in the closing state
    /// until the peer echoes (observed by [WebSocket::receive]) or the
    /// grace period of [WebSocket::wait_closed] runs out.
    pub async fn close(&self, reason: Option<CloseReason>) -> Result<(), Error> {
        match self.state() {
            WsState::Closed | WsState::Closing => Ok(()),
            _ => {
                self.send(Message::Close(reason)).await?;
                self.inner.state.set(WsState::Closing);
                Ok(())
            }
        }
    }

    /// Drain the peer until its close frame (or an error) arrives, bounded
    /// by `grace`. The socket is closed afterwards no matter what.
    pub async fn wait_closed(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while self.state() != WsState::Closed {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            match self.receive(Some(left)).await {
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
        self.inner.state.set(WsState::Closed);
    }

    /// Keep-alive driver: pings the peer on the configured interval and
    /// closes with 1011 when a pong fails to come back in time. Runs until
    /// the socket dies one way or the other.
    pub(crate) async fn ping_loop(&self) {
        loop {
            sleep(self.inner.ping_interval).await;

            if self.state() == WsState::Closed {
                return;
            }

            if let Some(pinged_at) = self.inner.last_ping.get() {
                let answered = self.inner.last_pong.get() >= pinged_at;
                if !answered && pinged_at.elapsed() >= self.inner.pong_timeout {
                    warn!("websocket pong timeout, closing");
                    let _ = self.close(Some(CloseCode::Error.into())).await;
                    self.inner.state.set(WsState::Closed);
                    return;
                }
            }

            if self.ping(Bytes::new()).await.is_err() {
                return;
            }
        }
    }
}
