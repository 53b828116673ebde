use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::HashMap,
    net::SocketAddr,
    rc::Rc,
};

use http::Method;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::{error::Error, handler::ListenerFn, request::Request, router::Route};

/// Stand-in route used when an error fires before resolution finished.
#[derive(Clone, Debug)]
pub struct PartialRoute {
    pub path: String,
    pub method: Method,
}

/// The route attached to an error event: resolved, or partial when routing
/// never got that far.
#[derive(Clone)]
pub enum ErrorRoute {
    Route(Rc<Route>),
    Partial(PartialRoute),
}

impl ErrorRoute {
    pub fn path(&self) -> &str {
        match self {
            Self::Route(route) => route.path(),
            Self::Partial(partial) => &partial.path,
        }
    }

    pub fn method(&self) -> &Method {
        match self {
            Self::Route(route) => route.method(),
            Self::Partial(partial) => &partial.method,
        }
    }
}

/// Payload of the `error` event.
#[derive(Clone)]
pub struct ErrorEvent {
    pub route: ErrorRoute,
    pub request: Request,
    pub worker: usize,
    pub error: Rc<Error>,
}

/// Payload handed to event listeners.
#[derive(Clone)]
pub enum Event {
    Startup,
    Shutdown,
    /// A connection went away, cleanly or not.
    Disconnect { peer: SocketAddr },
    /// A handler or middleware failed.
    Error(ErrorEvent),
    /// Application defined event dispatched by user code.
    Custom { name: String, data: Rc<dyn Any> },
}

/// Registration handle for one listener. Keep it around to unregister.
#[derive(Clone)]
pub struct Listener {
    pub(crate) id: usize,
    pub(crate) event: String,
    pub(crate) callback: ListenerFn,
}

impl Listener {
    /// The (prefixed) event name this listener is registered under.
    pub fn event(&self) -> &str {
        &self.event
    }
}

/// Listener table plus the set of in flight listener tasks.
///
/// Listeners never block the dispatcher: each invocation is its own local
/// task. Failures are logged and isolated from other listeners.
#[derive(Default)]
pub(crate) struct EventDispatcher {
    listeners: RefCell<HashMap<String, Vec<Listener>>>,
    tasks: RefCell<Vec<JoinHandle<()>>>,
    next_id: Cell<usize>,
}

/// Normalize an event name to its `on_` prefixed form.
fn event_name(name: &str) -> String {
    if name.starts_with("on_") {
        name.to_owned()
    } else {
        format!("on_{name}")
    }
}

impl EventDispatcher {
    pub(crate) fn add(&self, name: &str, callback: ListenerFn) -> Listener {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let listener = Listener {
            id,
            event: event_name(name),
            callback,
        };
        self.listeners
            .borrow_mut()
            .entry(listener.event.clone())
            .or_default()
            .push(listener.clone());
        listener
    }

    pub(crate) fn remove(&self, listener: &Listener) -> bool {
        let mut map = self.listeners.borrow_mut();
        let Some(list) = map.get_mut(&listener.event) else {
            return false;
        };
        let before = list.len();
        list.retain(|l| l.id != listener.id);
        let removed = list.len() != before;
        if list.is_empty() {
            map.remove(&listener.event);
        }
        removed
    }

    #[cfg(test)]
    fn listener_count(&self, name: &str) -> usize {
        self.listeners
            .borrow()
            .get(&event_name(name))
            .map_or(0, Vec::len)
    }

    /// Launch every listener registered for `name` as an independent task.
    /// With no listener registered, the built in fallbacks run instead.
    pub(crate) fn dispatch(&self, name: &str, event: Event) {
        let name = event_name(name);
        debug!("dispatching event {name}");

        self.reap();

        let callbacks: Vec<ListenerFn> = match self.listeners.borrow().get(&name) {
            Some(list) => list.iter().map(|l| l.callback.clone()).collect(),
            None => {
                default_listener(&name, &event);
                return;
            }
        };

        let mut tasks = self.tasks.borrow_mut();
        for callback in callbacks {
            let event = event.clone();
            let name = name.clone();
            tasks.push(tokio::task::spawn_local(async move {
                if let Err(e) = callback(event).await {
                    error!("listener for {name} failed: {e}");
                }
            }));
        }
    }

    fn reap(&self) {
        self.tasks.borrow_mut().retain(|task| !task.is_finished());
    }

    /// Abandon tracked listener tasks. Used on application close.
    pub(crate) fn cancel_all(&self) {
        for task in self.tasks.borrow_mut().drain(..) {
            task.abort();
        }
    }
}

/// Built in behavior for events nobody listens to. Errors get their chain
/// logged; everything else is only worth a debug line.
fn default_listener(name: &str, event: &Event) {
    match event {
        Event::Error(ref e) => {
            error!(
                "error handling {} {} on worker {}: {}",
                e.route.method(),
                e.route.path(),
                e.worker,
                e.error,
            );
            let mut source = std::error::Error::source(e.error.as_ref());
            while let Some(cause) = source {
                error!("caused by: {cause}");
                source = cause.source();
            }
        }
        _ => debug!("no listener registered for {name}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    use crate::handler::listener_service;

    #[tokio::test]
    async fn listeners_run_as_tasks() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let dispatcher = EventDispatcher::default();
                let hits = Rc::new(Cell::new(0));

                let hits2 = hits.clone();
                dispatcher.add(
                    "startup",
                    listener_service(move |_event| {
                        let hits = hits2.clone();
                        async move {
                            hits.set(hits.get() + 1);
                            Ok(())
                        }
                    }),
                );

                dispatcher.dispatch("startup", Event::Startup);
                // the dispatcher does not wait on listeners.
                tokio::time::sleep(Duration::from_millis(10)).await;
                assert_eq!(hits.get(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn listener_failure_is_isolated() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let dispatcher = EventDispatcher::default();
                let hits = Rc::new(Cell::new(0));

                dispatcher.add(
                    "ping",
                    listener_service(|_event| async {
                        Err(Error::Registration("listener blew up".into()))
                    }),
                );
                let hits2 = hits.clone();
                dispatcher.add(
                    "ping",
                    listener_service(move |_event| {
                        let hits = hits2.clone();
                        async move {
                            hits.set(hits.get() + 1);
                            Ok(())
                        }
                    }),
                );

                dispatcher.dispatch("ping", Event::Startup);
                tokio::time::sleep(Duration::from_millis(10)).await;
                // the failing listener did not take the other one down.
                assert_eq!(hits.get(), 1);
            })
            .await;
    }

    #[test]
    fn add_remove_round_trip() {
        let dispatcher = EventDispatcher::default();
        let listener = dispatcher.add("shutdown", listener_service(|_| async { Ok(()) }));
        assert_eq!(listener.event(), "on_shutdown");
        assert_eq!(dispatcher.listener_count("shutdown"), 1);

        assert!(dispatcher.remove(&listener));
        assert_eq!(dispatcher.listener_count("shutdown"), 0);
        assert!(!dispatcher.remove(&listener));
    }
}
