//! End to end coverage over a live application bound to 127.0.0.1:0,
//! driven by a raw tcp client.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::LocalSet;

use trestle::{
    handler_service, listener_service, middleware_service, websocket_service, AppConfig,
    Application, Json, Method, Route,
};

fn test_config() -> AppConfig {
    AppConfig {
        port: 0,
        worker_count: Some(1),
        shutdown_timeout: Duration::from_millis(500),
        ..AppConfig::default()
    }
}

/// One request, read to connection close.
async fn roundtrip(addr: SocketAddr, raw: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}

fn header_value<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    response.lines().find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

#[tokio::test]
async fn get_hello_returns_html() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let app = Application::new(test_config()).unwrap();
            app.get("/hello", handler_service(|_req, _params| async { Ok("hi") }))
                .unwrap();
            app.start().await.unwrap();

            let addr = app.local_addr();
            let response = roundtrip(
                addr,
                b"GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .await;

            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
            assert_eq!(
                header_value(&response, "content-type"),
                Some("text/html; charset=utf-8")
            );
            assert_eq!(header_value(&response, "content-length"), Some("2"));
            assert!(header_value(&response, "date").is_some());
            assert_eq!(header_value(&response, "server"), Some("trestle"));
            assert_eq!(body_of(&response), "hi");

            app.close().await.unwrap();
        })
        .await;
}

#[tokio::test]
async fn path_param_converts_to_json() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let app = Application::new(test_config()).unwrap();
            app.get(
                "/users/{id}",
                handler_service(|_req, params| async move {
                    let id: i64 = params.parse("id")?;
                    Ok(Json(serde_json::json!({ "id": id })))
                }),
            )
            .unwrap();
            app.start().await.unwrap();
            let addr = app.local_addr();

            let response = roundtrip(
                addr,
                b"GET /users/42 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .await;
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
            assert_eq!(header_value(&response, "content-type"), Some("application/json"));
            assert_eq!(body_of(&response), r#"{"id":42}"#);

            app.close().await.unwrap();
        })
        .await;
}

#[tokio::test]
async fn failed_conversion_is_a_400_naming_param_and_type() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let app = Application::new(test_config()).unwrap();
            app.get(
                "/users/{id}",
                handler_service(|_req, params| async move {
                    let id: i64 = params.parse("id")?;
                    Ok(Json(serde_json::json!({ "id": id })))
                }),
            )
            .unwrap();
            app.start().await.unwrap();
            let addr = app.local_addr();

            let response = roundtrip(
                addr,
                b"GET /users/abc HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .await;
            assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
            assert!(body_of(&response).contains("id"));
            assert!(body_of(&response).contains("i64"));

            app.close().await.unwrap();
        })
        .await;
}

#[tokio::test]
async fn method_mismatch_is_a_405_with_allow() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let app = Application::new(test_config()).unwrap();
            app.get("/hello", handler_service(|_req, _params| async { Ok("hi") }))
                .unwrap();
            app.start().await.unwrap();
            let addr = app.local_addr();

            let response = roundtrip(
                addr,
                b"DELETE /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .await;
            assert!(
                response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"),
                "{response}"
            );
            assert_eq!(header_value(&response, "allow"), Some("GET"));

            let response = roundtrip(
                addr,
                b"GET /missing HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .await;
            assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");

            app.close().await.unwrap();
        })
        .await;
}

fn mask_frame(raw: &[u8]) -> Vec<u8> {
    // raw is an unmasked server style frame; re-mask it as a client frame.
    let mut out = vec![raw[0], raw[1] | 0b1000_0000];
    let header = 2 + match raw[1] & 0b0111_1111 {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    out.extend_from_slice(&raw[2..header]);
    let mask = [0xa1u8, 0xb2, 0xc3, 0xd4];
    out.extend_from_slice(&mask);
    out.extend(raw[header..].iter().enumerate().map(|(i, b)| b ^ mask[i & 3]));
    out
}

fn masked_text(payload: &[u8]) -> Vec<u8> {
    let mut raw = vec![0b1000_0001, payload.len() as u8];
    raw.extend_from_slice(payload);
    mask_frame(&raw)
}

#[tokio::test]
async fn websocket_handshake_and_echo() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let app = Application::new(test_config()).unwrap();
            app.websocket(
                "/ws",
                websocket_service(|_req, ws, _params| async move {
                    while let Ok(message) = ws.receive(None).await {
                        match message {
                            trestle::ws::Message::Text(text) => ws.send(trestle::ws::Message::Text(text)).await?,
                            trestle::ws::Message::Close(_) => break,
                            _ => {}
                        }
                    }
                    Ok(())
                }),
            )
            .unwrap();
            app.start().await.unwrap();
            let addr = app.local_addr();

            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(
                    b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                      Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
                )
                .await
                .unwrap();

            // read the 101 head.
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                stream.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
            let head = String::from_utf8(head).unwrap();
            assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
            assert_eq!(
                header_value(&head, "sec-websocket-accept"),
                Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
            );
            assert_eq!(header_value(&head, "upgrade"), Some("websocket"));
            assert_eq!(header_value(&head, "connection"), Some("Upgrade"));

            // echo a text frame through the socket.
            stream.write_all(&masked_text(b"marco")).await.unwrap();
            let mut echo = [0u8; 7];
            stream.read_exact(&mut echo).await.unwrap();
            assert_eq!(&echo, &[0b1000_0001, 5, b'm', b'a', b'r', b'c', b'o']);

            // close handshake: client close, server echoes then shuts down.
            let close_raw = [0b1000_1000u8, 2, 0x03, 0xe8];
            stream.write_all(&mask_frame(&close_raw)).await.unwrap();
            let mut close_echo = [0u8; 4];
            stream.read_exact(&mut close_echo).await.unwrap();
            assert_eq!(close_echo, [0b1000_1000, 2, 0x03, 0xe8]);

            app.close().await.unwrap();
        })
        .await;
}

#[tokio::test]
async fn middlewares_run_concurrently_before_the_handler() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let app = Application::new(test_config()).unwrap();
            let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

            let o1 = order.clone();
            app.add_middleware(middleware_service(move |_route, _req, _params| {
                let order = o1.clone();
                async move {
                    order.borrow_mut().push("m1");
                    Ok(())
                }
            }));
            let o2 = order.clone();
            app.add_middleware(middleware_service(move |_route, _req, _params| {
                let order = o2.clone();
                async move {
                    order.borrow_mut().push("m2");
                    Ok(())
                }
            }));

            let oh = order.clone();
            app.get(
                "/mw/{n}",
                handler_service(move |_req, params| {
                    let order = oh.clone();
                    async move {
                        // converted arguments are visible to the handler.
                        let n: i64 = params.parse("n")?;
                        assert_eq!(n, 7);
                        order.borrow_mut().push("h");
                        Ok("done")
                    }
                }),
            )
            .unwrap();

            app.start().await.unwrap();
            let addr = app.local_addr();

            let response = roundtrip(
                addr,
                b"GET /mw/7 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .await;
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");

            let order = order.borrow();
            assert_eq!(order.len(), 3);
            // both middlewares ran exactly once, and strictly before the
            // handler.
            assert_eq!(order.iter().filter(|s| **s == "m1").count(), 1);
            assert_eq!(order.iter().filter(|s| **s == "m2").count(), 1);
            assert_eq!(order.last(), Some(&"h"));

            app.close().await.unwrap();
        })
        .await;
}

#[tokio::test]
async fn middleware_close_short_circuits_the_handler() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let app = Application::new(test_config()).unwrap();
            let handler_ran = Rc::new(Cell::new(false));

            app.add_middleware(middleware_service(|_route, req, _params| async move {
                req.close().await
            }));

            let flag = handler_ran.clone();
            app.get(
                "/guarded",
                handler_service(move |_req, _params| {
                    let flag = flag.clone();
                    async move {
                        flag.set(true);
                        Ok("never")
                    }
                }),
            )
            .unwrap();

            app.start().await.unwrap();
            let addr = app.local_addr();

            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET /guarded HTTP/1.1\r\nHost: x\r\n\r\n")
                .await
                .unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();

            // connection closed without a response, handler never ran.
            assert!(buf.is_empty());
            assert!(!handler_ran.get());

            app.close().await.unwrap();
        })
        .await;
}

#[tokio::test]
async fn keep_alive_serves_requests_in_order() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let app = Application::new(test_config()).unwrap();
            app.get("/a", handler_service(|_req, _params| async { Ok("first") }))
                .unwrap();
            app.get("/b", handler_service(|_req, _params| async { Ok("second") }))
                .unwrap();
            app.start().await.unwrap();
            let addr = app.local_addr();

            let mut stream = TcpStream::connect(addr).await.unwrap();
            // both heads go out before either response is read; the server
            // must answer in arrival order.
            stream
                .write_all(
                    b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n\
                      GET /b HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
                )
                .await
                .unwrap();

            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            let both = String::from_utf8_lossy(&buf);

            let first = both.find("first").expect("first response missing");
            let second = both.find("second").expect("second response missing");
            assert!(first < second);
            assert_eq!(both.matches("HTTP/1.1 200 OK").count(), 2);

            app.close().await.unwrap();
        })
        .await;
}

#[tokio::test]
async fn error_event_fires_and_client_gets_500() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let app = Application::new(test_config()).unwrap();
            let seen = Rc::new(RefCell::new(Vec::new()));

            let seen2 = seen.clone();
            app.add_event_listener(
                listener_service(move |event| {
                    let seen = seen2.clone();
                    async move {
                        if let trestle::Event::Error(e) = event {
                            seen.borrow_mut().push((e.route.path().to_owned(), e.worker));
                        }
                        Ok(())
                    }
                }),
                "error",
            );

            app.get(
                "/boom",
                handler_service(|_req, _params| async {
                    Err::<&str, _>(trestle::Error::Registration("handler exploded".into()))
                }),
            )
            .unwrap();

            app.start().await.unwrap();
            let addr = app.local_addr();

            let response = roundtrip(
                addr,
                b"GET /boom HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .await;
            assert!(
                response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"),
                "{response}"
            );
            // the reason stays generic; internals are not leaked.
            assert_eq!(body_of(&response), "Internal Server Error");

            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(seen.borrow().as_slice(), &[("/boom".to_owned(), 0)]);

            app.close().await.unwrap();
        })
        .await;
}

#[tokio::test]
async fn url_prefix_applies_to_registrations() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let config = AppConfig {
                url_prefix: "/api".into(),
                ..test_config()
            };
            let app = Application::new(config).unwrap();
            app.get("/ping", handler_service(|_req, _params| async { Ok("pong") }))
                .unwrap();
            app.start().await.unwrap();
            let addr = app.local_addr();

            let response = roundtrip(
                addr,
                b"GET /api/ping HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .await;
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");

            let response = roundtrip(
                addr,
                b"GET /ping HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .await;
            assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");

            app.close().await.unwrap();
        })
        .await;
}

#[tokio::test]
async fn post_body_model_binding() {
    let local = LocalSet::new();
    local
        .run_until(async {
            #[derive(serde::Deserialize, serde::Serialize)]
            struct User {
                name: String,
            }

            let app = Application::new(test_config()).unwrap();
            app.post(
                "/users",
                handler_service(|req: trestle::Request, _params| async move {
                    let user: User = req.model("user").await?;
                    Ok((Json(user), 201))
                }),
            )
            .unwrap();
            app.start().await.unwrap();
            let addr = app.local_addr();

            let body = br#"{"user":{"name":"izzy"}}"#;
            let raw = format!(
                "POST /users HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let mut raw = raw.into_bytes();
            raw.extend_from_slice(body);

            let response = roundtrip(addr, &raw).await;
            assert!(response.starts_with("HTTP/1.1 201 Created\r\n"), "{response}");
            assert_eq!(body_of(&response), r#"{"name":"izzy"}"#);

            app.close().await.unwrap();
        })
        .await;
}

struct Greeter;

impl trestle::Injectable for Greeter {
    fn routes(self: Rc<Self>) -> Vec<Route> {
        vec![
            Route::new(
                "/greet",
                Method::GET,
                handler_service(|_req, _params| async { Ok("hello") }),
            )
            .unwrap(),
        ]
    }

    fn listeners(self: Rc<Self>) -> Vec<trestle::ListenerDef> {
        vec![trestle::ListenerDef::new(
            "startup",
            listener_service(|_event| async { Ok(()) }),
        )]
    }

    fn middlewares(self: Rc<Self>) -> Vec<trestle::MiddlewareFn> {
        vec![middleware_service(|_route, _req, _params| async { Ok(()) })]
    }
}

#[test]
fn injection_round_trips_registration_state() {
    let app = Application::new(test_config()).unwrap();
    app.get("/existing", handler_service(|_req, _params| async { Ok("kept") }))
        .unwrap();

    let obj = Rc::new(Greeter);
    app.inject(obj.clone()).unwrap();
    assert!(app.get_route("/greet", &Method::GET).is_some());

    // double injection of the same object is refused.
    assert!(app.inject(obj.clone()).is_err());

    app.eject(&obj).unwrap();
    assert!(app.get_route("/greet", &Method::GET).is_none());
    assert!(app.get_route("/existing", &Method::GET).is_some());

    // eject of something never injected is an error.
    assert!(app.eject(&obj).is_err());
}

#[test]
fn duplicate_route_registration_fails_synchronously() {
    let app = Application::new(test_config()).unwrap();
    app.get("/dup", handler_service(|_req, _params| async { Ok("a") }))
        .unwrap();
    let err = app.get("/dup", handler_service(|_req, _params| async { Ok("b") }));
    assert!(matches!(err, Err(trestle::Error::Registration(_))));
}
