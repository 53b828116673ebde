//! Minimal http + websocket application.
//!
//! ```sh
//! cargo run --example chat
//! curl http://127.0.0.1:8080/hello/world
//! ```

use trestle::{handler_service, websocket_service, AppConfig, Application, Json};

fn main() -> Result<(), trestle::Error> {
    tracing_subscriber::fmt().init();

    let app = Application::new(AppConfig::default())?;

    app.get(
        "/hello/{name}",
        handler_service(|_req, params| async move {
            let name: String = params.parse("name")?;
            Ok(format!("<h1>hello, {name}</h1>"))
        }),
    )?;

    app.get(
        "/users/{id}",
        handler_service(|_req, params| async move {
            let id: i64 = params.parse("id")?;
            Ok(Json(serde_json::json!({ "id": id })))
        }),
    )?;

    app.websocket(
        "/echo",
        websocket_service(|_req, ws, _params| async move {
            while let Ok(message) = ws.receive(None).await {
                match message {
                    trestle::ws::Message::Text(text) => ws.send_text(String::from_utf8_lossy(&text)).await?,
                    trestle::ws::Message::Close(_) => break,
                    _ => {}
                }
            }
            Ok(())
        }),
    )?;

    app.run()
}
