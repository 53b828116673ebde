use std::rc::Rc;

use http::Method;

use crate::handler::HandlerFn;

/// A class style view: one path, one handler per http method.
///
/// Registering a view turns every `(method, handler)` pair it reports into
/// a route at [View::path]; removing it takes those routes down again.
pub trait View {
    fn path(&self) -> &str;

    /// The method table. Handlers close over `self` the same way
    /// [crate::inject::Injectable] callbacks do.
    fn handlers(self: Rc<Self>) -> Vec<(Method, HandlerFn)>;
}
