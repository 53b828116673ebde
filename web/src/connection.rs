//! Per connection dispatch: keep-alive request loop, middleware pipeline,
//! handler invocation and the websocket takeover path.

use std::{net::SocketAddr, rc::Rc, time::Duration};

use futures_util::future::join_all;
use http::{StatusCode, Version};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    app::Application,
    error::Error,
    events::{ErrorEvent, ErrorRoute, Event, PartialRoute},
    h1::{decode::decode_head, error::ProtoError},
    params::Params,
    request::Request,
    response::Response,
    router::{Endpoint, Route},
    stream::{Reader, Transport, Writer},
    ws::{error::HandshakeError, CloseCode, WebSocket, WsState},
};

/// A leftover body bigger than this is not worth draining for keep-alive;
/// the connection is closed instead.
const DRAIN_LIMIT: u64 = 65_536;

/// Grace period for the websocket closing handshake.
const WS_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Serve one accepted connection until it closes.
pub(crate) async fn handle(app: Application, worker_id: usize, stream: TcpStream, peer: SocketAddr) {
    let local = stream.local_addr().unwrap_or(peer);

    let transport = match app.config().tls.clone() {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => Transport::Tls(Box::new(tls)),
            Err(e) => {
                debug!("tls accept from {peer} failed: {e}");
                return;
            }
        },
        None => Transport::Plain(stream),
    };

    let (read_half, write_half) = tokio::io::split(transport);
    let reader = Rc::new(Mutex::new(Reader::new(read_half)));
    let writer = Rc::new(Mutex::new(Writer::new(write_half)));

    // requests on one connection are strictly sequential: the next head is
    // not decoded until the previous response is fully written.
    loop {
        let head = {
            let mut reader = reader.lock().await;
            decode_head(&mut reader, Some(app.config().keep_alive)).await
        };

        let head = match head {
            Ok(Some(head)) => head,
            // peer went away between requests.
            Ok(None) => break,
            // keep-alive idle timeout expired.
            Err(Error::Timeout) => break,
            Err(Error::Proto(ref e)) => {
                let status = match e {
                    ProtoError::HeaderTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                    _ => StatusCode::BAD_REQUEST,
                };
                write_raw(&app, &writer, status).await;
                break;
            }
            Err(e) => {
                debug!("read error from {peer}: {e}");
                break;
            }
        };

        let request = Request::new(
            head,
            reader.clone(),
            writer.clone(),
            peer,
            local,
            worker_id,
            app.date(),
            app.session_cookie_name(),
        );

        let upgraded = dispatch(&app, &request).await;
        if upgraded {
            // the websocket owned the connection until it closed.
            break;
        }

        if !request.keep_alive() {
            break;
        }

        if !drain_body(&request).await {
            break;
        }
    }

    app.dispatch("disconnect", Event::Disconnect { peer });

    let mut writer = writer.lock().await;
    let _ = writer.close().await;
}

/// Discard body bytes the handler left unread so the next head parse does
/// not land in the middle of them. Returns false when the connection is no
/// longer usable for another request.
async fn drain_body(request: &Request) -> bool {
    let leftover = request.body_remaining();
    if leftover == 0 {
        return true;
    }
    if leftover > DRAIN_LIMIT {
        return false;
    }

    let mut body = request.stream(Some(Duration::from_secs(5)));
    while let Some(chunk) = body.chunk().await {
        if chunk.is_err() {
            return false;
        }
    }
    request.body_remaining() == 0
}

/// Route, convert, run middlewares and the handler, write the response.
/// Returns true when the connection was taken over by a websocket.
async fn dispatch(app: &Application, request: &Request) -> bool {
    let method = request.method().clone();
    let path = request.url().path().to_owned();

    let (params, route) = match app.resolve(&method, &path) {
        Ok(resolved) => resolved,
        Err(e) => {
            respond_error(app, request, None, e).await;
            return false;
        }
    };
    request.set_route(route.clone());

    // per-route middlewares first, then the global ones; all of them run
    // concurrently and the handler waits for the full set.
    let mut middlewares = Vec::new();
    for mw in route.middlewares() {
        middlewares.push(mw(route.clone(), request.clone(), params.clone()));
    }
    for mw in app.global_middlewares() {
        middlewares.push(mw(route.clone(), request.clone(), params.clone()));
    }
    for result in join_all(middlewares).await {
        if let Err(e) = result {
            respond_error(app, request, Some(route.clone()), e).await;
            return false;
        }
    }

    // a middleware aborted the pipeline.
    if request.is_closed() {
        return false;
    }

    match route.endpoint().clone() {
        Endpoint::WebSocket(handler) => {
            serve_websocket(app, request, route, handler, params).await;
            true
        }
        Endpoint::Http(handler) => {
            match handler(request.clone(), params).await {
                Ok(response) => write_response(request, &route, response).await,
                Err(e) => respond_error(app, request, Some(route), e).await,
            }
            false
        }
    }
}

async fn write_response(request: &Request, route: &Rc<Route>, response: Response) {
    match request.send(response).await {
        Ok(status) => {
            if let Some(callback) = route.after_request() {
                if let Err(e) = callback(request.clone(), status).await {
                    warn!("after-request callback for {} failed: {e}", route.path());
                }
            }
        }
        Err(e) => {
            debug!("failed to write response to {}: {e}", request.client());
            let _ = request.close().await;
        }
    }
}

/// Hand the connection to a websocket route: handshake, construct the
/// socket, run the handler with the keep-alive pinger beside it, close.
async fn serve_websocket(
    app: &Application,
    request: &Request,
    route: Rc<Route>,
    handler: crate::handler::WsHandlerFn,
    params: Params,
) {
    // echo the first subprotocol offer; extensions are not negotiated.
    let subprotocol = request
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty());

    if let Err(e) = request.handshake(subprotocol.as_deref(), None).await {
        respond_error(app, request, Some(route), e).await;
        return;
    }

    let config = app.config();
    let ws = WebSocket::new(
        request.reader(),
        request.writer(),
        subprotocol,
        None,
        config.ws_ping_interval,
        config.ws_pong_timeout,
    );

    let result = tokio::select! {
        res = handler(request.clone(), ws.clone(), params) => Some(res),
        // the ping loop only resolves once the socket is dead (pong
        // timeout or write failure), which cancels the handler.
        _ = ws.ping_loop() => None,
    };

    match result {
        Some(Ok(())) => {
            if ws.state() != WsState::Closed {
                let _ = ws.close(Some(CloseCode::Normal.into())).await;
                ws.wait_closed(WS_CLOSE_GRACE).await;
            }
        }
        Some(Err(e)) => {
            let _ = ws.close(Some(CloseCode::Error.into())).await;
            ws.wait_closed(WS_CLOSE_GRACE).await;
            dispatch_error(app, request, Some(route), e);
        }
        None => {}
    }

    let _ = request.close().await;
}

/// Report a failed request: answer the peer (unless something already went
/// out) and fire the `error` event.
async fn respond_error(app: &Application, request: &Request, route: Option<Rc<Route>>, error: Error) {
    if !request.has_responded() && !request.is_closed() {
        if let Err(e) = request.send(error_response(&error)).await {
            debug!("failed to write error response to {}: {e}", request.client());
            let _ = request.close().await;
        }
    }
    dispatch_error(app, request, route, error);
}

fn dispatch_error(app: &Application, request: &Request, route: Option<Rc<Route>>, error: Error) {
    let route = match route {
        Some(route) => ErrorRoute::Route(route),
        None => ErrorRoute::Partial(PartialRoute {
            path: request.url().path().to_owned(),
            method: request.method().clone(),
        }),
    };

    app.dispatch(
        "error",
        Event::Error(ErrorEvent {
            route,
            request: request.clone(),
            worker: request.worker(),
            error: Rc::new(error),
        }),
    );
}

/// Render the client facing response for an error.
fn error_response(error: &Error) -> Response {
    let status = error.status_code();

    let mut response = match *error {
        Error::NotFound { .. } | Error::BadConversion { .. } => Response::text(error.to_string()),
        Error::MethodNotAllowed { ref allow } => {
            let allow = allow
                .iter()
                .map(http::Method::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            Response::text(error.to_string()).with_header("allow", allow)
        }
        Error::Handshake(ref e) => {
            let response = Response::text(error.to_string());
            if matches!(e, HandshakeError::GetMethodRequired) {
                response.with_header("allow", "GET")
            } else {
                response
            }
        }
        Error::Status { ref message, .. } => match message {
            Some(message) => Response::text(message.clone()),
            None => Response::text(status.canonical_reason().unwrap_or("error")),
        },
        // internals are not for the peer to see.
        _ => Response::text("Internal Server Error"),
    };

    response.set_status_unchecked(status);
    response
}

/// Answer a request whose head never parsed into a `Request`.
async fn write_raw(app: &Application, writer: &Rc<Mutex<Writer>>, status: StatusCode) {
    let mut response = Response::text(status.canonical_reason().unwrap_or("Bad Request"));
    response.set_status_unchecked(status);
    response.headers_mut().append("connection", "close");

    let bytes = response.prepare_with(Version::HTTP_11, &app.date());
    let mut writer = writer.lock().await;
    let _ = writer.write(&bytes, true, None).await;
}
