use std::{future::Future, pin::Pin, rc::Rc};

use http::StatusCode;

use crate::{
    error::Error,
    events::Event,
    params::Params,
    request::Request,
    response::{IntoResponse, Response},
    router::Route,
    ws::WebSocket,
};

pub type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

/// Type erased route handler: `(request, params) -> response`.
pub type HandlerFn = Rc<dyn Fn(Request, Params) -> LocalBoxFuture<Result<Response, Error>>>;

/// Type erased websocket handler: `(request, socket, params)`.
pub type WsHandlerFn = Rc<dyn Fn(Request, WebSocket, Params) -> LocalBoxFuture<Result<(), Error>>>;

/// Type erased middleware: `(route, request, params)`. A middleware aborts
/// the pipeline by closing the request.
pub type MiddlewareFn = Rc<dyn Fn(Rc<Route>, Request, Params) -> LocalBoxFuture<Result<(), Error>>>;

/// Type erased event listener.
pub type ListenerFn = Rc<dyn Fn(Event) -> LocalBoxFuture<Result<(), Error>>>;

/// Type erased after-request callback, run once the response left the wire.
pub type AfterRequestFn = Rc<dyn Fn(Request, StatusCode) -> LocalBoxFuture<Result<(), Error>>>;

/// Erase an async handler into a [HandlerFn], converting its return value
/// into a [Response] the way `Application::parse_response` describes: a
/// string renders as html, a json value as json, a tuple picks the status,
/// a [Response] passes through.
pub fn handler_service<F, Fut, R>(f: F) -> HandlerFn
where
    F: Fn(Request, Params) -> Fut + 'static,
    Fut: Future<Output = Result<R, Error>> + 'static,
    R: IntoResponse,
{
    Rc::new(move |req, params| {
        let fut = f(req, params);
        Box::pin(async move { fut.await.and_then(IntoResponse::into_response) })
    })
}

/// Erase an async websocket handler into a [WsHandlerFn].
pub fn websocket_service<F, Fut>(f: F) -> WsHandlerFn
where
    F: Fn(Request, WebSocket, Params) -> Fut + 'static,
    Fut: Future<Output = Result<(), Error>> + 'static,
{
    Rc::new(move |req, ws, params| Box::pin(f(req, ws, params)))
}

/// Erase an async middleware into a [MiddlewareFn].
pub fn middleware_service<F, Fut>(f: F) -> MiddlewareFn
where
    F: Fn(Rc<Route>, Request, Params) -> Fut + 'static,
    Fut: Future<Output = Result<(), Error>> + 'static,
{
    Rc::new(move |route, req, params| Box::pin(f(route, req, params)))
}

/// Erase an async event listener into a [ListenerFn].
pub fn listener_service<F, Fut>(f: F) -> ListenerFn
where
    F: Fn(Event) -> Fut + 'static,
    Fut: Future<Output = Result<(), Error>> + 'static,
{
    Rc::new(move |event| Box::pin(f(event)))
}

/// Erase an async after-request callback into an [AfterRequestFn].
pub fn after_request_service<F, Fut>(f: F) -> AfterRequestFn
where
    F: Fn(Request, StatusCode) -> Fut + 'static,
    Fut: Future<Output = Result<(), Error>> + 'static,
{
    Rc::new(move |req, status| Box::pin(f(req, status)))
}
