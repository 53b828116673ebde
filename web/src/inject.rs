use std::rc::Rc;

use crate::handler::{ListenerFn, MiddlewareFn};
use crate::router::Route;

/// A listener declaration carried by an [Injectable].
pub struct ListenerDef {
    pub event: String,
    pub callback: ListenerFn,
}

impl ListenerDef {
    pub fn new(event: impl Into<String>, callback: ListenerFn) -> Self {
        Self {
            event: event.into(),
            callback,
        }
    }
}

/// A group of routes, listeners and middlewares that registers (and
/// unregisters) on an application as one unit.
///
/// Implementors hand out callbacks bound to their own `Rc`, so every
/// callback is invoked with its owning object as the receiver:
///
/// ```ignore
/// impl Injectable for Counter {
///     fn routes(self: Rc<Self>) -> Vec<Route> {
///         let this = self.clone();
///         vec![Route::new("/count", Method::GET, handler_service(move |_req, _params| {
///             let this = this.clone();
///             async move { Ok(this.value().to_string()) }
///         }))
///         .unwrap()]
///     }
/// }
/// ```
///
/// `Application::inject` registers everything the trait reports;
/// `Application::eject` removes exactly those registrations again.
pub trait Injectable {
    fn routes(self: Rc<Self>) -> Vec<Route> {
        Vec::new()
    }

    fn listeners(self: Rc<Self>) -> Vec<ListenerDef> {
        Vec::new()
    }

    fn middlewares(self: Rc<Self>) -> Vec<MiddlewareFn> {
        Vec::new()
    }
}

/// A named [Injectable], registered and looked up by name.
pub trait Resource: Injectable {
    fn name(&self) -> &str;
}
