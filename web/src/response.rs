use std::{io, path::Path, pin::Pin};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use http::{StatusCode, Version};
use serde::Serialize;

use crate::{
    cookie::Cookie,
    date::DateHandle,
    error::Error,
    h1::encode::{self, BodySize},
    headers::Headers,
};

/// A file body backed by an open handle.
pub struct File {
    file: tokio::fs::File,
    len: u64,
}

impl File {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self { file, len })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn into_parts(self) -> (tokio::fs::File, u64) {
        (self.file, self.len)
    }
}

/// Streaming body producer.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>>>>;

/// Response body payloads.
pub enum Body {
    Empty,
    Bytes(Bytes),
    File(File),
    Stream(BodyStream),
}

/// A response under construction.
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Empty,
        }
    }

    /// Empty 200.
    pub fn empty() -> Self {
        Self::new(StatusCode::OK)
    }

    /// An html body, the default rendering for plain string returns.
    pub fn html(body: impl Into<String>) -> Self {
        let mut res = Self::new(StatusCode::OK);
        res.headers.append("content-type", "text/html; charset=utf-8");
        res.body = Body::Bytes(Bytes::from(body.into()));
        res
    }

    pub fn text(body: impl Into<String>) -> Self {
        let mut res = Self::new(StatusCode::OK);
        res.headers.append("content-type", "text/plain; charset=utf-8");
        res.body = Body::Bytes(Bytes::from(body.into()));
        res
    }

    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, Error> {
        let body = serde_json::to_vec(value)?;
        let mut res = Self::new(StatusCode::OK);
        res.headers.append("content-type", "application/json");
        res.body = Body::Bytes(Bytes::from(body));
        Ok(res)
    }

    pub fn bytes(body: impl Into<Bytes>) -> Self {
        let mut res = Self::new(StatusCode::OK);
        res.headers.append("content-type", "application/octet-stream");
        res.body = Body::Bytes(body.into());
        res
    }

    pub fn file(file: File) -> Self {
        let mut res = Self::new(StatusCode::OK);
        res.headers.append("content-type", "application/octet-stream");
        res.body = Body::File(file);
        res
    }

    /// A producer driven body, written chunked.
    pub fn stream(stream: impl Stream<Item = Result<Bytes, Error>> + 'static) -> Self {
        let mut res = Self::new(StatusCode::OK);
        res.body = Body::Stream(Box::pin(stream));
        res
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Replace the status with one a handler is allowed to produce: inside
    /// 100..=599 and not a redirect (redirects go through
    /// `Request::redirect`).
    pub fn set_status(&mut self, code: u16) -> Result<(), Error> {
        self.status = validate_status(code)?;
        Ok(())
    }

    pub(crate) fn set_status_unchecked(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Attach a `Set-Cookie` header.
    pub fn set_cookie(&mut self, cookie: &Cookie) {
        self.headers.append("set-cookie", cookie.to_string());
    }

    pub(crate) fn body_size(&self) -> BodySize {
        if self.status == StatusCode::SWITCHING_PROTOCOLS
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
        {
            return BodySize::None;
        }
        match self.body {
            Body::Empty => BodySize::Sized(0),
            Body::Bytes(ref b) => BodySize::Sized(b.len()),
            Body::File(ref f) => BodySize::Sized(f.len() as usize),
            Body::Stream(_) => BodySize::Stream,
        }
    }

    pub(crate) fn take_body(&mut self) -> Body {
        std::mem::replace(&mut self.body, Body::Empty)
    }

    /// Render status line, headers and (for fixed size bodies) the payload.
    /// Streaming bodies render the preamble only; their chunks are written
    /// by whoever drives the stream.
    pub fn prepare(&self) -> Bytes {
        self.prepare_with(Version::HTTP_11, &DateHandle::new())
    }

    pub(crate) fn prepare_with(&self, version: Version, date: &DateHandle) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        encode::encode_head(&mut buf, version, self.status, &self.headers, self.body_size(), date);
        if let Body::Bytes(ref bytes) = self.body {
            buf.extend_from_slice(bytes);
        }
        buf.freeze()
    }
}

pub(crate) fn validate_status(code: u16) -> Result<StatusCode, Error> {
    if !(100..=599).contains(&code) {
        return Err(Error::Registration(format!("status code {code} is not valid")));
    }
    if (300..=399).contains(&code) {
        return Err(Error::Registration(
            "redirect status codes cannot be returned from a handler, use Request::redirect".into(),
        ));
    }
    StatusCode::from_u16(code).map_err(|_| Error::Registration(format!("status code {code} is not valid")))
}

/// Conversion from handler return values to a [Response].
///
/// Mirrors the dynamic `parse_response` table of the source framework:
/// strings render as html, json values as json, byte buffers as bytes,
/// tuples override the status, a `Response` passes through.
pub trait IntoResponse {
    fn into_response(self) -> Result<Response, Error>;
}

impl IntoResponse for Response {
    fn into_response(self) -> Result<Response, Error> {
        Ok(self)
    }
}

impl IntoResponse for String {
    fn into_response(self) -> Result<Response, Error> {
        Ok(Response::html(self))
    }
}

impl IntoResponse for &'static str {
    fn into_response(self) -> Result<Response, Error> {
        Ok(Response::html(self))
    }
}

impl IntoResponse for serde_json::Value {
    fn into_response(self) -> Result<Response, Error> {
        Response::json(&self)
    }
}

impl IntoResponse for Vec<u8> {
    fn into_response(self) -> Result<Response, Error> {
        Ok(Response::bytes(self))
    }
}

impl IntoResponse for Bytes {
    fn into_response(self) -> Result<Response, Error> {
        Ok(Response::bytes(self))
    }
}

impl IntoResponse for File {
    fn into_response(self) -> Result<Response, Error> {
        Ok(Response::file(self))
    }
}

impl IntoResponse for () {
    fn into_response(self) -> Result<Response, Error> {
        Ok(Response::empty())
    }
}

/// Serialize any model as a json response body.
pub struct Json<T>(pub T);

impl<T: Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> Result<Response, Error> {
        Response::json(&self.0)
    }
}

impl<R: IntoResponse> IntoResponse for (R, u16) {
    fn into_response(self) -> Result<Response, Error> {
        let (inner, code) = self;
        let mut response = inner.into_response()?;
        response.set_status_unchecked(validate_status(code)?);
        Ok(response)
    }
}
