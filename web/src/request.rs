use std::{
    cell::{Cell, RefCell},
    net::SocketAddr,
    rc::Rc,
    time::{Duration, SystemTime},
};

use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode, Version};
use serde::de::DeserializeOwned;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use crate::{
    cookie::CookieJar,
    date::DateHandle,
    error::Error,
    form::FormData,
    h1::{
        body::{BodyReader, BODY_CHUNK},
        decode::RequestHead,
        encode,
    },
    headers::Headers,
    response::{validate_status, Body, Response},
    router::Route,
    session::Session,
    stream::{Reader, Writer},
    url::Url,
    ws,
};

/// An in flight request.
///
/// Cheap to clone: clones are handles onto one shared request, which is how
/// concurrently running middlewares and the handler all observe the same
/// state. A request borrows its connection's reader/writer and never
/// outlives the connection.
#[derive(Clone)]
pub struct Request {
    inner: Rc<Inner>,
}

struct Inner {
    method: Method,
    url: Url,
    version: Version,
    headers: Headers,
    reader: Rc<Mutex<Reader>>,
    writer: Rc<Mutex<Writer>>,
    body: RefCell<Option<Bytes>>,
    body_consumed: Rc<Cell<u64>>,
    created_at: SystemTime,
    worker_id: usize,
    peer: SocketAddr,
    local: SocketAddr,
    route: RefCell<Option<Rc<Route>>>,
    closed: Cell<bool>,
    responded: Cell<bool>,
    date: DateHandle,
    session_cookie: String,
}

#[allow(clippy::too_many_arguments)]
impl Request {
    pub(crate) fn new(
        head: RequestHead,
        reader: Rc<Mutex<Reader>>,
        writer: Rc<Mutex<Writer>>,
        peer: SocketAddr,
        local: SocketAddr,
        worker_id: usize,
        date: DateHandle,
        session_cookie: String,
    ) -> Self {
        Self {
            inner: Rc::new(Inner {
                method: head.method,
                url: head.url,
                version: head.version,
                headers: head.headers,
                reader,
                writer,
                body: RefCell::new(None),
                body_consumed: Rc::new(Cell::new(0)),
                created_at: SystemTime::now(),
                worker_id,
                peer,
                local,
                route: RefCell::new(None),
                closed: Cell::new(false),
                responded: Cell::new(false),
                date,
                session_cookie,
            }),
        }
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn version(&self) -> Version {
        self.inner.version
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    /// Query pairs in arrival order, preserved as written on the wire.
    pub fn query(&self) -> &[(String, String)] {
        self.inner.url.query()
    }

    pub fn cookies(&self) -> CookieJar {
        self.inner.headers.cookies()
    }

    pub fn created_at(&self) -> SystemTime {
        self.inner.created_at
    }

    /// Id of the worker that accepted this connection.
    pub fn worker(&self) -> usize {
        self.inner.worker_id
    }

    /// Peer address of the connection.
    pub fn client(&self) -> SocketAddr {
        self.inner.peer
    }

    /// `X-Forwarded-For` when present, for deployments behind a proxy.
    pub fn forwarded_for(&self) -> Option<&str> {
        self.inner.headers.get("x-forwarded-for")
    }

    /// Local address of the connection.
    pub fn server(&self) -> SocketAddr {
        self.inner.local
    }

    /// The route this request resolved to, once routing ran.
    pub fn route(&self) -> Option<Rc<Route>> {
        self.inner.route.borrow().clone()
    }

    pub(crate) fn set_route(&self, route: Rc<Route>) {
        *self.inner.route.borrow_mut() = Some(route);
    }

    /// Whether this request carries a well formed websocket upgrade.
    pub fn is_websocket(&self) -> bool {
        ws::verify_handshake(&self.inner.method, self.inner.version, &self.inner.headers).is_ok()
    }

    /// Stream the body in chunks of at most 65536 bytes, bounded by the
    /// declared `Content-Length`. Bytes are pulled off the connection
    /// lazily; nothing is read ahead of the caller. A second stream picks
    /// up where the first one stopped.
    pub fn stream(&self, timeout: Option<Duration>) -> BodyReader {
        BodyReader::new(
            self.inner.reader.clone(),
            self.body_remaining(),
            timeout,
            self.inner.body_consumed.clone(),
        )
    }

    /// Declared body bytes not yet pulled off the connection.
    pub(crate) fn body_remaining(&self) -> u64 {
        self.inner
            .headers
            .content_length()
            .unwrap_or(0)
            .saturating_sub(self.inner.body_consumed.get())
    }

    /// Read (and cache) the whole body.
    pub async fn read(&self, timeout: Option<Duration>) -> Result<Bytes, Error> {
        if let Some(body) = self.inner.body.borrow().clone() {
            return Ok(body);
        }
        let body = self.stream(timeout).collect().await?;
        *self.inner.body.borrow_mut() = Some(body.clone());
        Ok(body)
    }

    /// The body as text. Non utf-8 bytes are replaced rather than failed on.
    pub async fn text(&self) -> Result<String, Error> {
        let body = self.read(None).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Deserialize the json body.
    pub async fn json<T: DeserializeOwned>(&self, check_content_type: bool) -> Result<T, Error> {
        if check_content_type && self.inner.headers.content_type() != Some("application/json") {
            return Err(Error::Status {
                status: StatusCode::BAD_REQUEST,
                message: Some("content-type must be application/json".into()),
            });
        }
        let body = self.read(None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Bind a model from one key of the json body, the declarative
    /// counterpart of a typed path parameter. Absence and shape mismatch
    /// both report as a conversion failure on `key`.
    pub async fn model<M: DeserializeOwned>(&self, key: &str) -> Result<M, Error> {
        let bad = |key: &str| Error::BadConversion {
            param: key.to_owned(),
            ty: std::any::type_name::<M>(),
        };
        let value: serde_json::Value = self.json(false).await.map_err(|_| bad(key))?;
        let sub = value.get(key).ok_or_else(|| bad(key))?;
        serde_json::from_value(sub.clone()).map_err(|_| bad(key))
    }

    /// Decode an urlencoded or multipart form body.
    pub async fn form(&self) -> Result<FormData, Error> {
        let content_type = self.inner.headers.content_type().map(str::to_owned);
        let body = self.read(None).await?;

        match content_type.as_deref() {
            Some("multipart/form-data") => {
                let boundary = self
                    .inner
                    .headers
                    .get("content-type")
                    .and_then(|v| v.split(';').find_map(|p| p.trim().strip_prefix("boundary=")))
                    .ok_or(Error::Proto(crate::h1::error::ProtoError::HeaderValue))?
                    .trim_matches('"')
                    .to_owned();
                FormData::from_multipart(&body, &boundary)
            }
            _ => FormData::from_urlencoded(&body),
        }
    }

    /// The cookie backed session of this request.
    pub fn session(&self) -> Session {
        let jar = self.cookies();
        Session::from_cookie(jar.get(&self.inner.session_cookie))
    }

    /// Serialize and write a response. Returns the status that went out.
    pub async fn send(&self, mut response: Response) -> Result<StatusCode, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let status = response.status();
        let mut head = BytesMut::from(&response.prepare_with(self.inner.version, &self.inner.date)[..]);

        let mut writer = self.inner.writer.lock().await;
        match response.take_body() {
            // fixed size payloads were rendered into the head buffer by
            // prepare_with already (bytes) or follow in bounded chunks.
            Body::Empty | Body::Bytes(_) => {
                writer.write(&head, true, None).await?;
            }
            Body::File(file) => {
                writer.write(&head, false, None).await?;
                let (mut file, len) = file.into_parts();
                let mut left = len;
                let mut chunk = BytesMut::with_capacity(BODY_CHUNK.min(len as usize));
                while left > 0 {
                    chunk.clear();
                    let n = file.read_buf(&mut chunk).await?;
                    if n == 0 {
                        return Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "file shrank while serving",
                        )));
                    }
                    left = left.saturating_sub(n as u64);
                    writer.write(&chunk, false, None).await?;
                }
                writer.write(&[], true, None).await?;
            }
            Body::Stream(mut stream) => {
                writer.write(&head, false, None).await?;
                head.clear();
                while let Some(item) =
                    std::future::poll_fn(|cx| stream.as_mut().poll_next(cx)).await
                {
                    let bytes = item?;
                    encode::encode_chunk(&mut head, &bytes);
                    writer.write(&head, false, None).await?;
                    head.clear();
                }
                encode::encode_chunk_eof(&mut head);
                writer.write(&head, true, None).await?;
            }
        }

        self.inner.responded.set(true);
        Ok(status)
    }

    /// Perform the websocket handshake, answering 101 with the accept key
    /// and echoing the offered subprotocol/extensions handed in.
    pub async fn handshake(
        &self,
        subprotocol: Option<&str>,
        extensions: Option<&str>,
    ) -> Result<(), Error> {
        let key = ws::verify_handshake(&self.inner.method, self.inner.version, &self.inner.headers)?;
        let response = ws::handshake_response(key, subprotocol, extensions);
        self.send(response).await?;
        Ok(())
    }

    /// Build the response for a redirect. The dedicated path for 3xx, which
    /// handlers may not produce through plain status codes.
    pub fn redirect(&self, to: &str, status: Option<u16>, body: Option<String>) -> Result<Response, Error> {
        let status = status.unwrap_or(302);
        if !matches!(status, 301 | 302 | 303 | 307 | 308) {
            return Err(Error::Registration(format!(
                "{status} is not a valid redirect status code"
            )));
        }

        let mut response = match body {
            Some(body) => Response::html(body),
            None => Response::empty(),
        };
        response.set_status_unchecked(StatusCode::from_u16(status).expect("validated above"));
        response.headers_mut().append("location", to);
        Ok(response)
    }

    /// Short circuit with an explicit error status. Handlers `return
    /// Err(request.abort(403, ...))` and the dispatcher renders it.
    /// Only 4xx/5xx qualify; anything below 400 is a programmer error,
    /// not an error response.
    pub fn abort(&self, status: u16, message: Option<String>) -> Error {
        if status < 400 {
            return Error::Registration(format!("abort status must be >= 400, got {status}"));
        }
        match validate_status(status) {
            Ok(status) => Error::Status { status, message },
            Err(e) => e,
        }
    }

    /// Close the connection. Middlewares use this to abort the pipeline;
    /// the handler then never runs.
    pub async fn close(&self) -> Result<(), Error> {
        if !self.is_closed() {
            self.inner.closed.set(true);
            self.inner.writer.lock().await.close().await?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    pub(crate) fn has_responded(&self) -> bool {
        self.inner.responded.get()
    }

    pub(crate) fn reader(&self) -> Rc<Mutex<Reader>> {
        self.inner.reader.clone()
    }

    pub(crate) fn writer(&self) -> Rc<Mutex<Writer>> {
        self.inner.writer.clone()
    }

    /// Whether the connection can serve another request afterwards.
    pub(crate) fn keep_alive(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let connection = self.inner.headers.get("connection");
        match self.inner.version {
            Version::HTTP_10 => connection.is_some_and(|v| v.eq_ignore_ascii_case("keep-alive")),
            _ => !connection.is_some_and(|v| {
                v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close"))
            }),
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.inner.method)
            .field("path", &self.inner.url.path())
            .field("version", &self.inner.version)
            .field("peer", &self.inner.peer)
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tokio::io::AsyncWriteExt;

    use crate::h1::decode::decode_head;

    async fn request_from(raw: &[u8]) -> (Request, tokio::io::DuplexStream) {
        let (mut tx, rx) = tokio::io::duplex(8192);
        let (client_side, server_write) = tokio::io::duplex(8192);

        tx.write_all(raw).await.unwrap();
        drop(tx);

        let mut reader = Reader::new(rx);
        let head = decode_head(&mut reader, None).await.unwrap().unwrap();

        let request = Request::new(
            head,
            Rc::new(Mutex::new(reader)),
            Rc::new(Mutex::new(Writer::new(server_write))),
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:8080".parse().unwrap(),
            0,
            DateHandle::new(),
            "session".into(),
        );
        (request, client_side)
    }

    #[tokio::test]
    async fn body_reads_are_cached() {
        let raw = b"POST /p HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        let (request, _client) = request_from(raw).await;

        assert_eq!(&request.read(None).await.unwrap()[..], b"hello");
        // second read is served from the buffer, not the (drained) socket.
        assert_eq!(&request.read(None).await.unwrap()[..], b"hello");
        assert_eq!(request.text().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn json_and_model_binding() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct User {
            name: String,
        }

        let raw = b"POST /p HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\nContent-Length: 26\r\n\r\n{\"user\":{\"name\":\"izzy\"}}  ";
        let (request, _client) = request_from(raw).await;

        let user: User = request.model("user").await.unwrap();
        assert_eq!(user, User { name: "izzy".into() });

        match request.model::<User>("missing").await {
            Err(Error::BadConversion { param, .. }) => assert_eq!(param, "missing"),
            other => panic!("expected conversion error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn json_content_type_check() {
        let raw = b"POST /p HTTP/1.1\r\nHost: x\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\n{}";
        let (request, _client) = request_from(raw).await;

        assert!(request.json::<serde_json::Value>(true).await.is_err());
        assert!(request.json::<serde_json::Value>(false).await.is_ok());
    }

    #[tokio::test]
    async fn websocket_detection() {
        let raw = b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
            Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        let (request, _client) = request_from(raw).await;
        assert!(request.is_websocket());

        let raw = b"GET /ws HTTP/1.1\r\nHost: x\r\n\r\n";
        let (request, _client) = request_from(raw).await;
        assert!(!request.is_websocket());
    }

    #[tokio::test]
    async fn redirect_validation() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let (request, _client) = request_from(raw).await;

        let response = request.redirect("/new", None, None).unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get("location"), Some("/new"));

        assert!(request.redirect("/new", Some(200), None).is_err());
        assert!(request.redirect("/new", Some(304), None).is_err());
    }

    #[tokio::test]
    async fn abort_requires_error_status() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let (request, _client) = request_from(raw).await;

        match request.abort(403, Some("forbidden".into())) {
            Error::Status { status, message } => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(message.as_deref(), Some("forbidden"));
            }
            other => panic!("expected status error, got {other:?}"),
        }

        // anything below 400 is a programmer error, not an error response.
        assert!(matches!(request.abort(200, None), Error::Registration(_)));
        assert!(matches!(request.abort(302, None), Error::Registration(_)));
        assert!(matches!(request.abort(700, None), Error::Registration(_)));
    }

    #[tokio::test]
    async fn close_marks_and_refuses() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let (request, _client) = request_from(raw).await;

        assert!(!request.is_closed());
        request.close().await.unwrap();
        assert!(request.is_closed());
        assert!(matches!(request.send(Response::empty()).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn keep_alive_semantics() {
        let (request, _c) = request_from(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(request.keep_alive());

        let (request, _c) = request_from(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
        assert!(!request.keep_alive());

        let (request, _c) = request_from(b"GET / HTTP/1.0\r\nHost: x\r\n\r\n").await;
        assert!(!request.keep_alive());

        let (request, _c) =
            request_from(b"GET / HTTP/1.0\r\nHost: x\r\nConnection: keep-alive\r\n\r\n").await;
        assert!(request.keep_alive());
    }
}
