//! A small, self contained http/1.1 and websocket server framework.
//!
//! An [Application] binds its listening socket at construction, routes
//! requests through a registration ordered pattern table and serves them
//! from a set of single threaded workers sharing the socket.
//!
//! ```no_run
//! use trestle::{handler_service, AppConfig, Application};
//!
//! fn main() -> Result<(), trestle::Error> {
//!     let app = Application::new(AppConfig::default())?;
//!
//!     app.get(
//!         "/hello/{name}",
//!         handler_service(|_req, params| async move {
//!             let name: String = params.parse("name")?;
//!             Ok(format!("hello, {name}"))
//!         }),
//!     )?;
//!
//!     app.run()
//! }
//! ```
//!
//! Handlers take `(request, params)` and return anything convertible into a
//! [Response]: strings render as html, [response::Json] and
//! `serde_json::Value` as json, tuples override the status. WebSocket
//! routes receive a [ws::WebSocket] that owns the connection after the
//! upgrade handshake.

mod app;
mod connection;
mod cookie;
mod date;
mod events;
mod form;
mod handler;
mod headers;
mod inject;
mod middleware;
mod params;
mod request;
mod router;
mod session;
mod settings;
mod stream;
mod url;
mod view;

pub mod error;
pub mod h1;
pub mod response;
pub mod ws;

pub use self::app::{AppConfig, Application};
pub use self::cookie::{Cookie, CookieJar};
pub use self::error::Error;
pub use self::events::{ErrorEvent, ErrorRoute, Event, Listener, PartialRoute};
pub use self::form::{FormData, Part};
pub use self::handler::{
    after_request_service, handler_service, listener_service, middleware_service, websocket_service,
    AfterRequestFn, HandlerFn, ListenerFn, LocalBoxFuture, MiddlewareFn, WsHandlerFn,
};
pub use self::headers::Headers;
pub use self::inject::{Injectable, ListenerDef, Resource};
pub use self::middleware::{Middleware, MiddlewareScope};
pub use self::params::Params;
pub use self::request::Request;
pub use self::response::{File, IntoResponse, Json, Response};
pub use self::router::{Pattern, Route, Router};
pub use self::session::Session;
pub use self::settings::{Settings, SETTING_ENV_PREFIX};
pub use self::stream::{Reader, Writer};
pub use self::url::Url;
pub use self::view::View;
pub use self::ws::WebSocket;

/// http types shared with the rest of the ecosystem.
pub use http::{Method, StatusCode, Version};
