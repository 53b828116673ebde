use std::{
    cell::{Cell, Ref, RefCell, RefMut},
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    rc::Rc,
    time::Duration,
};

use http::Method;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use trestle_server::{bind, into_tokio, ConnectionService, ListenConfig, Worker};

use crate::{
    connection,
    date::DateHandle,
    error::Error,
    events::{Event, EventDispatcher, Listener},
    handler::{HandlerFn, ListenerFn, MiddlewareFn, WsHandlerFn},
    inject::{Injectable, Resource},
    middleware::{Middleware, MiddlewareScope},
    router::{Route, Router},
    settings::Settings,
    view::View,
};

/// Application construction options.
#[derive(Clone)]
pub struct AppConfig {
    /// Bind host. Defaults to loopback of the selected family.
    pub host: Option<String>,
    pub port: u16,
    /// Prefix prepended to every registered route pattern.
    pub url_prefix: String,
    pub ipv6: bool,
    /// Accept loop owners sharing the listening socket.
    /// Defaults to `2 * cpus + 1`.
    pub worker_count: Option<usize>,
    pub backlog: u32,
    /// `SO_REUSEPORT` on the listener, for multi process deployments where
    /// the kernel spreads accepts across processes.
    pub reuse_port: bool,
    /// Idle timeout between requests on a keep-alive connection.
    pub keep_alive: Duration,
    /// Grace period for in flight connections on close.
    pub shutdown_timeout: Duration,
    pub ws_ping_interval: Duration,
    pub ws_pong_timeout: Duration,
    /// Seed [Settings] from `TRESTLE_` prefixed environment variables.
    pub load_settings_from_env: bool,
    /// Terminate tls on accepted connections.
    pub tls: Option<tokio_rustls::TlsAcceptor>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 8080,
            url_prefix: String::new(),
            ipv6: false,
            worker_count: None,
            backlog: 2048,
            reuse_port: false,
            keep_alive: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            ws_ping_interval: Duration::from_secs(20),
            ws_pong_timeout: Duration::from_secs(20),
            load_settings_from_env: false,
            tls: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AppState {
    Created,
    Started,
    Closed,
}

struct ViewEntry {
    view: Rc<dyn View>,
    route_keys: Vec<(String, Method)>,
}

#[derive(Default)]
struct Injected {
    route_keys: Vec<(String, Method)>,
    listeners: Vec<Listener>,
    middleware_ids: Vec<usize>,
}

/// The application: listening sockets, routing table, middlewares, event
/// listeners and the worker set serving it all.
///
/// Cheap to clone; clones share one application. Registration happens
/// before [Application::start], serving treats the tables as read only.
#[derive(Clone)]
pub struct Application {
    inner: Rc<AppInner>,
}

struct AppInner {
    config: AppConfig,
    settings: RefCell<Settings>,
    router: RefCell<Router>,
    middlewares: RefCell<Vec<Middleware>>,
    next_middleware_id: Cell<usize>,
    events: EventDispatcher,
    views: RefCell<HashMap<String, ViewEntry>>,
    resources: RefCell<HashMap<String, Rc<dyn Resource>>>,
    injected: RefCell<HashMap<usize, Injected>>,
    std_listeners: RefCell<Vec<std::net::TcpListener>>,
    local_addrs: Vec<SocketAddr>,
    workers: RefCell<Vec<Rc<Worker>>>,
    worker_handles: RefCell<Vec<JoinHandle<()>>>,
    worker_count: usize,
    state: Cell<AppState>,
    date: DateHandle,
}

impl Application {
    /// Bind the listening socket(s) and build the application. The socket
    /// binds here, at construction, so an `Application` that exists is one
    /// that owns its address.
    pub fn new(config: AppConfig) -> Result<Self, Error> {
        let host = match config.host.clone() {
            Some(host) => host,
            None if config.ipv6 => "::1".to_owned(),
            None => "127.0.0.1".to_owned(),
        };
        let ip: IpAddr = host
            .parse()
            .map_err(|_| Error::Registration(format!("invalid bind host {host:?}")))?;
        if config.ipv6 && !ip.is_ipv6() {
            return Err(Error::Registration(format!(
                "host {host:?} is not an ipv6 address"
            )));
        }

        let listener = bind(SocketAddr::new(ip, config.port), &listen_config(&config))?;
        let local = listener.local_addr()?;

        Self::with_listeners(config, vec![listener], vec![local], None)
    }

    /// Dual-stack application: one ipv4 and one ipv6 listener on the same
    /// port, with the worker set partitioned between them.
    /// `workers_per_family` defaults to `cpus + 1`.
    pub fn dualstack(
        ipv4_host: Option<&str>,
        ipv6_host: Option<&str>,
        mut config: AppConfig,
        workers_per_family: Option<usize>,
    ) -> Result<Self, Error> {
        let per_family = workers_per_family.unwrap_or_else(|| available_cpus() + 1);
        if per_family == 0 {
            return Err(Error::Registration("worker count must not be zero".into()));
        }
        config.worker_count = Some(per_family * 2);

        let v4: IpAddr = ipv4_host
            .unwrap_or("127.0.0.1")
            .parse()
            .map_err(|_| Error::Registration("invalid ipv4 host".into()))?;
        let v6: IpAddr = ipv6_host
            .unwrap_or("::1")
            .parse()
            .map_err(|_| Error::Registration("invalid ipv6 host".into()))?;
        if !v4.is_ipv4() || !v6.is_ipv6() {
            return Err(Error::Registration(
                "dualstack requires one ipv4 and one ipv6 host".into(),
            ));
        }

        let cfg = listen_config(&config);
        let first = bind(SocketAddr::new(v4, config.port), &cfg)?;
        // an ephemeral port is resolved by the first bind and reused for
        // the second family.
        let port = first.local_addr()?.port();
        let second = bind(SocketAddr::new(v6, port), &cfg)?;

        let locals = vec![first.local_addr()?, second.local_addr()?];
        Self::with_listeners(config, vec![first, second], locals, None)
    }

    /// Build an application over an already bound listener.
    pub fn from_listener(config: AppConfig, listener: std::net::TcpListener) -> Result<Self, Error> {
        let local = listener.local_addr()?;
        Self::with_listeners(config, vec![listener], vec![local], None)
    }

    fn with_listeners(
        config: AppConfig,
        listeners: Vec<std::net::TcpListener>,
        local_addrs: Vec<SocketAddr>,
        worker_count: Option<usize>,
    ) -> Result<Self, Error> {
        let worker_count = worker_count
            .or(config.worker_count)
            .unwrap_or_else(|| available_cpus() * 2 + 1);
        if worker_count == 0 {
            return Err(Error::Registration("worker count must not be zero".into()));
        }

        let settings = if config.load_settings_from_env {
            Settings::from_env()
        } else {
            Settings::new()
        };

        let router = Router::new(config.url_prefix.clone());

        Ok(Self {
            inner: Rc::new(AppInner {
                config,
                settings: RefCell::new(settings),
                router: RefCell::new(router),
                middlewares: RefCell::new(Vec::new()),
                next_middleware_id: Cell::new(0),
                events: EventDispatcher::default(),
                views: RefCell::new(HashMap::new()),
                resources: RefCell::new(HashMap::new()),
                injected: RefCell::new(HashMap::new()),
                std_listeners: RefCell::new(listeners),
                local_addrs,
                workers: RefCell::new(Vec::new()),
                worker_handles: RefCell::new(Vec::new()),
                worker_count,
                state: Cell::new(AppState::Created),
                date: DateHandle::new(),
            }),
        })
    }

    /// Addresses the application is bound to. Two entries in dual-stack
    /// mode, otherwise one.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.inner.local_addrs
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addrs[0]
    }

    pub fn settings(&self) -> Ref<'_, Settings> {
        self.inner.settings.borrow()
    }

    pub fn settings_mut(&self) -> RefMut<'_, Settings> {
        self.inner.settings.borrow_mut()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    /// The worker set. Empty until [Application::start].
    pub fn workers(&self) -> Vec<Rc<Worker>> {
        self.inner.workers.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.get() == AppState::Closed
    }

    pub fn is_serving(&self) -> bool {
        self.inner.state.get() == AppState::Started
            && self.inner.workers.borrow().iter().all(|w| w.is_serving())
    }

    // ---------- routes ----------

    pub fn add_route(&self, route: Route) -> Result<Rc<Route>, Error> {
        self.inner.router.borrow_mut().add_route(route)
    }

    pub fn remove_route(&self, path: &str, method: &Method) -> Option<Rc<Route>> {
        self.inner.router.borrow_mut().remove_route(path, method)
    }

    pub fn get_route(&self, path: &str, method: &Method) -> Option<Rc<Route>> {
        self.inner.router.borrow().get_route(path, method)
    }

    /// Merge another router's routes and middlewares into this application.
    pub fn add_router(&self, router: Router) -> Result<(), Error> {
        let middlewares: Vec<MiddlewareFn> = router.middlewares().to_vec();
        self.inner.router.borrow_mut().merge(router)?;
        for middleware in middlewares {
            self.add_middleware(middleware);
        }
        Ok(())
    }

    /// Register a handler for `method` at `path`.
    pub fn route(&self, path: &str, method: Method, handler: HandlerFn) -> Result<Rc<Route>, Error> {
        self.add_route(Route::new(path, method, handler)?)
    }

    pub fn get(&self, path: &str, handler: HandlerFn) -> Result<Rc<Route>, Error> {
        self.route(path, Method::GET, handler)
    }

    pub fn put(&self, path: &str, handler: HandlerFn) -> Result<Rc<Route>, Error> {
        self.route(path, Method::PUT, handler)
    }

    pub fn post(&self, path: &str, handler: HandlerFn) -> Result<Rc<Route>, Error> {
        self.route(path, Method::POST, handler)
    }

    pub fn delete(&self, path: &str, handler: HandlerFn) -> Result<Rc<Route>, Error> {
        self.route(path, Method::DELETE, handler)
    }

    pub fn head(&self, path: &str, handler: HandlerFn) -> Result<Rc<Route>, Error> {
        self.route(path, Method::HEAD, handler)
    }

    pub fn options(&self, path: &str, handler: HandlerFn) -> Result<Rc<Route>, Error> {
        self.route(path, Method::OPTIONS, handler)
    }

    pub fn patch(&self, path: &str, handler: HandlerFn) -> Result<Rc<Route>, Error> {
        self.route(path, Method::PATCH, handler)
    }

    /// Register a websocket route at `path`.
    pub fn websocket(&self, path: &str, handler: WsHandlerFn) -> Result<Rc<Route>, Error> {
        self.add_route(Route::websocket(path, handler)?)
    }

    // ---------- middlewares ----------

    /// Register a global middleware, run for every request after the
    /// matched route's own middlewares.
    pub fn add_middleware(&self, callback: MiddlewareFn) -> Middleware {
        let id = self.inner.next_middleware_id.get();
        self.inner.next_middleware_id.set(id + 1);
        let middleware = Middleware {
            id,
            scope: MiddlewareScope::Global,
            callback,
        };
        self.inner.middlewares.borrow_mut().push(middleware.clone());
        middleware
    }

    pub fn remove_middleware(&self, middleware: &Middleware) -> bool {
        self.remove_middleware_id(middleware.id)
    }

    fn remove_middleware_id(&self, id: usize) -> bool {
        let mut middlewares = self.inner.middlewares.borrow_mut();
        let before = middlewares.len();
        middlewares.retain(|m| m.id != id);
        middlewares.len() != before
    }

    pub(crate) fn global_middlewares(&self) -> Vec<MiddlewareFn> {
        self.inner
            .middlewares
            .borrow()
            .iter()
            .map(|m| m.callback.clone())
            .collect()
    }

    // ---------- events ----------

    /// Register an event listener. `name` may be given with or without the
    /// `on_` prefix.
    pub fn add_event_listener(&self, callback: ListenerFn, name: &str) -> Listener {
        self.inner.events.add(name, callback)
    }

    pub fn remove_event_listener(&self, listener: &Listener) -> bool {
        self.inner.events.remove(listener)
    }

    /// Fire `name`, launching every registered listener as an independent
    /// task. Must be called from within the application's event loop.
    pub fn dispatch(&self, name: &str, event: Event) {
        self.inner.events.dispatch(name, event);
    }

    // ---------- views ----------

    /// Register a view: every handler it reports becomes a route at the
    /// view's path. Fails without side effects when any route collides.
    pub fn add_view(&self, view: Rc<dyn View>) -> Result<(), Error> {
        let path = view.path().to_owned();
        if self.inner.views.borrow().contains_key(&path) {
            return Err(Error::Registration(format!(
                "a view is already registered at {path:?}"
            )));
        }

        let route_keys = self.register_routes(view.clone().handlers().into_iter().map(|(method, handler)| {
            Route::new(&path, method, handler)
        }))?;

        self.inner
            .views
            .borrow_mut()
            .insert(path, ViewEntry { view, route_keys });
        Ok(())
    }

    pub fn remove_view(&self, path: &str) -> Option<Rc<dyn View>> {
        let entry = self.inner.views.borrow_mut().remove(path)?;
        for (pattern, method) in &entry.route_keys {
            self.remove_route(pattern, method);
        }
        Some(entry.view)
    }

    pub fn get_view(&self, path: &str) -> Option<Rc<dyn View>> {
        self.inner.views.borrow().get(path).map(|entry| entry.view.clone())
    }

    // ---------- resources ----------

    /// Register a resource: a named injectable. Its routes, listeners and
    /// middlewares are injected as one unit.
    pub fn add_resource(&self, resource: Rc<dyn Resource>) -> Result<(), Error> {
        let name = resource.name().to_owned();
        if self.inner.resources.borrow().contains_key(&name) {
            return Err(Error::Registration(format!(
                "a resource named {name:?} is already registered"
            )));
        }
        self.inject(resource.clone())?;
        self.inner.resources.borrow_mut().insert(name, resource);
        Ok(())
    }

    pub fn remove_resource(&self, name: &str) -> Option<Rc<dyn Resource>> {
        let resource = self.inner.resources.borrow_mut().remove(name)?;
        let _ = self.eject(&resource);
        Some(resource)
    }

    pub fn get_resource(&self, name: &str) -> Option<Rc<dyn Resource>> {
        self.inner.resources.borrow().get(name).cloned()
    }

    // ---------- injection ----------

    /// Register everything an [Injectable] reports, atomically: when any
    /// route collides, nothing stays registered.
    pub fn inject<T>(&self, obj: Rc<T>) -> Result<(), Error>
    where
        T: Injectable + ?Sized + 'static,
    {
        let key = Rc::as_ptr(&obj) as *const () as usize;
        if self.inner.injected.borrow().contains_key(&key) {
            return Err(Error::Registration("object is already injected".into()));
        }

        let route_keys = self.register_routes(obj.clone().routes().into_iter().map(Ok))?;

        let listeners = obj
            .clone()
            .listeners()
            .into_iter()
            .map(|def| self.add_event_listener(def.callback, &def.event))
            .collect();

        let middleware_ids = obj
            .clone()
            .middlewares()
            .into_iter()
            .map(|callback| self.add_middleware(callback).id)
            .collect();

        self.inner.injected.borrow_mut().insert(
            key,
            Injected {
                route_keys,
                listeners,
                middleware_ids,
            },
        );
        Ok(())
    }

    /// Undo a previous [Application::inject], restoring the registration
    /// state it found.
    pub fn eject<T>(&self, obj: &Rc<T>) -> Result<(), Error>
    where
        T: Injectable + ?Sized + 'static,
    {
        let key = Rc::as_ptr(obj) as *const () as usize;
        let entry = self
            .inner
            .injected
            .borrow_mut()
            .remove(&key)
            .ok_or_else(|| Error::Registration("object was not injected".into()))?;

        for (pattern, method) in &entry.route_keys {
            self.remove_route(pattern, method);
        }
        for listener in &entry.listeners {
            self.remove_event_listener(listener);
        }
        for id in entry.middleware_ids {
            self.remove_middleware_id(id);
        }
        Ok(())
    }

    /// Register a batch of routes, removing the ones already added when a
    /// later one fails.
    fn register_routes(
        &self,
        routes: impl Iterator<Item = Result<Route, Error>>,
    ) -> Result<Vec<(String, Method)>, Error> {
        let mut added = Vec::new();
        for route in routes {
            let registered = route.and_then(|r| self.add_route(r));
            match registered {
                Ok(route) => added.push((route.path().to_owned(), route.method().clone())),
                Err(e) => {
                    for (pattern, method) in &added {
                        self.remove_route(pattern, method);
                    }
                    return Err(e);
                }
            }
        }
        Ok(added)
    }

    // ---------- lifecycle ----------

    /// Install the workers onto the current event loop and dispatch the
    /// `startup` event. Must run inside a `tokio::task::LocalSet`.
    pub async fn start(&self) -> Result<(), Error> {
        match self.inner.state.get() {
            AppState::Started => return Err(Error::Registration("application is already started".into())),
            AppState::Closed => return Err(Error::Registration("application is closed".into())),
            AppState::Created => {}
        }

        let std_listeners: Vec<_> = self.inner.std_listeners.borrow_mut().drain(..).collect();
        let mut listeners = Vec::with_capacity(std_listeners.len());
        for listener in std_listeners {
            listeners.push(Rc::new(into_tokio(listener)?));
        }

        let mut workers = self.inner.workers.borrow_mut();
        let mut handles = self.inner.worker_handles.borrow_mut();
        for id in 0..self.inner.worker_count {
            // dual-stack partitions workers across the two listeners.
            let listener = listeners[id % listeners.len()].clone();
            let worker = Worker::new(id, listener);

            let app = self.clone();
            let service: ConnectionService = Rc::new(move |stream, peer| {
                let app = app.clone();
                Box::pin(async move { connection::handle(app, id, stream, peer).await })
            });

            handles.push(worker.spawn(service));
            workers.push(worker);
        }
        drop((workers, handles));

        self.inner.state.set(AppState::Started);
        info!("application started with {} workers", self.inner.worker_count);
        self.dispatch("startup", Event::Startup);
        Ok(())
    }

    /// Stop accepting, wind down in flight connections within the shutdown
    /// grace period and dispatch the `shutdown` event.
    pub async fn close(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Ok(());
        }

        let workers: Vec<_> = self.inner.workers.borrow().clone();
        for worker in &workers {
            worker.stop(self.inner.config.shutdown_timeout).await;
        }
        for handle in self.inner.worker_handles.borrow_mut().drain(..) {
            handle.abort();
        }

        self.inner.state.set(AppState::Closed);
        self.inner.events.cancel_all();
        info!("application closed");
        self.dispatch("shutdown", Event::Shutdown);
        Ok(())
    }

    /// Run the application on its own single threaded runtime until
    /// interrupted.
    pub fn run(&self) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let local = tokio::task::LocalSet::new();

        local.block_on(&runtime, async {
            self.start().await?;
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("ctrl-c handler unavailable, serving until closed");
                std::future::pending::<()>().await;
            }
            self.close().await
        })
    }

    // ---------- internals for the connection handler ----------

    pub(crate) fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub(crate) fn resolve(
        &self,
        method: &Method,
        path: &str,
    ) -> Result<(crate::params::Params, Rc<Route>), Error> {
        self.inner.router.borrow().resolve(method, path)
    }

    pub(crate) fn date(&self) -> DateHandle {
        self.inner.date.clone()
    }

    pub(crate) fn session_cookie_name(&self) -> String {
        self.inner
            .settings
            .borrow()
            .get("session_cookie_name")
            .unwrap_or("session")
            .to_owned()
    }
}

fn listen_config(config: &AppConfig) -> ListenConfig {
    ListenConfig {
        backlog: config.backlog,
        reuse_address: true,
        reuse_port: config.reuse_port,
    }
}

fn available_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}
