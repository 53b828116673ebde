use std::rc::Rc;

use http::Method;

use crate::{
    error::Error,
    handler::{AfterRequestFn, HandlerFn, MiddlewareFn, WsHandlerFn},
    params::Params,
};

/// A compiled path pattern.
///
/// `{name}` captures one path segment, a trailing `{name:path}` captures the
/// rest of the path including slashes, anything else matches literally.
#[derive(Clone, Debug)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Rest(String),
}

impl Pattern {
    pub fn compile(path: &str) -> Result<Self, Error> {
        if !path.starts_with('/') {
            return Err(Error::Registration(format!(
                "route path {path:?} must start with '/'"
            )));
        }

        let mut segments = Vec::new();
        let parts: Vec<&str> = path[1..].split('/').collect();

        for (idx, part) in parts.iter().enumerate() {
            let segment = match part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                Some(inner) => match inner.split_once(':') {
                    Some((name, "path")) => {
                        if idx != parts.len() - 1 {
                            return Err(Error::Registration(format!(
                                "path capture {inner:?} must be the last segment of {path:?}"
                            )));
                        }
                        Segment::Rest(validate_name(path, name)?)
                    }
                    Some((_, kind)) => {
                        return Err(Error::Registration(format!(
                            "unknown capture kind {kind:?} in route path {path:?}"
                        )))
                    }
                    None => Segment::Param(validate_name(path, inner)?),
                },
                None => {
                    if part.contains(['{', '}']) {
                        return Err(Error::Registration(format!(
                            "unbalanced braces in route path {path:?}"
                        )));
                    }
                    Segment::Literal((*part).to_owned())
                }
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: path.to_owned(),
            segments,
        })
    }

    /// The pattern as registered (prefix included).
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Match a request path in full, extracting named captures.
    pub fn matches(&self, path: &str) -> Option<Params> {
        let path = path.strip_prefix('/')?;
        let mut params = Params::new();
        let mut rest = path;

        for (idx, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Rest(name) => {
                    // rest capture is the final segment and wants 1+ chars.
                    if rest.is_empty() {
                        return None;
                    }
                    params.push(name.clone(), rest);
                    return Some(params);
                }
                _ => {
                    let (part, remainder) = match rest.split_once('/') {
                        Some((part, remainder)) => (part, Some(remainder)),
                        None => (rest, None),
                    };

                    match segment {
                        Segment::Literal(lit) if lit == part => {}
                        Segment::Param(name) if !part.is_empty() => {
                            params.push(name.clone(), part);
                        }
                        _ => return None,
                    }

                    let last = idx == self.segments.len() - 1;
                    match (last, remainder) {
                        (true, None) => return Some(params),
                        (true, Some(_)) | (false, None) => return None,
                        (false, Some(remainder)) => rest = remainder,
                    }
                }
            }
        }

        None
    }
}

fn validate_name(path: &str, name: &str) -> Result<String, Error> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Registration(format!(
            "invalid parameter name {name:?} in route path {path:?}"
        )));
    }
    Ok(name.to_owned())
}

/// What a route dispatches to.
#[derive(Clone)]
pub(crate) enum Endpoint {
    Http(HandlerFn),
    WebSocket(WsHandlerFn),
}

/// A registered route: compiled pattern, method, handler and its optional
/// per-route middlewares and after-request callback.
pub struct Route {
    pattern: Pattern,
    method: Method,
    endpoint: Endpoint,
    middlewares: Vec<MiddlewareFn>,
    after_request: Option<AfterRequestFn>,
}

impl Route {
    pub fn new(path: &str, method: Method, handler: HandlerFn) -> Result<Self, Error> {
        Ok(Self {
            pattern: Pattern::compile(path)?,
            method,
            endpoint: Endpoint::Http(handler),
            middlewares: Vec::new(),
            after_request: None,
        })
    }

    /// A websocket route. Always registered under GET, the only method the
    /// upgrade handshake accepts.
    pub fn websocket(path: &str, handler: WsHandlerFn) -> Result<Self, Error> {
        Ok(Self {
            pattern: Pattern::compile(path)?,
            method: Method::GET,
            endpoint: Endpoint::WebSocket(handler),
            middlewares: Vec::new(),
            after_request: None,
        })
    }

    /// Attach a per-route middleware. Kept in registration order.
    pub fn with_middleware(mut self, middleware: MiddlewareFn) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn with_after_request(mut self, callback: AfterRequestFn) -> Self {
        self.after_request = Some(callback);
        self
    }

    pub fn path(&self) -> &str {
        self.pattern.raw()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self.endpoint, Endpoint::WebSocket(_))
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn middlewares(&self) -> &[MiddlewareFn] {
        &self.middlewares
    }

    pub(crate) fn after_request(&self) -> Option<&AfterRequestFn> {
        self.after_request.as_ref()
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("path", &self.path())
            .field("method", &self.method)
            .field("websocket", &self.is_websocket())
            .finish()
    }
}

/// Registration ordered route table.
pub struct Router {
    prefix: String,
    routes: Vec<Rc<Route>>,
    middlewares: Vec<MiddlewareFn>,
}

impl Router {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            routes: Vec::new(),
            middlewares: Vec::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn routes(&self) -> &[Rc<Route>] {
        &self.routes
    }

    /// Register a route. The router prefix is baked into the pattern here;
    /// duplicate `(pattern, method)` pairs are rejected and leave the table
    /// untouched.
    pub fn add_route(&mut self, mut route: Route) -> Result<Rc<Route>, Error> {
        if !self.prefix.is_empty() {
            let full = format!("{}{}", self.prefix, route.pattern.raw());
            route.pattern = Pattern::compile(&full)?;
        }

        if self.lookup(route.path(), &route.method).is_some() {
            return Err(Error::Registration(format!(
                "{:?} is already registered for {}",
                route.path(),
                route.method
            )));
        }

        let route = Rc::new(route);
        self.routes.push(route.clone());
        Ok(route)
    }

    fn add_registered(&mut self, route: Rc<Route>) -> Result<(), Error> {
        if self.lookup(route.path(), &route.method).is_some() {
            return Err(Error::Registration(format!(
                "{:?} is already registered for {}",
                route.path(),
                route.method
            )));
        }
        self.routes.push(route);
        Ok(())
    }

    pub fn remove_route(&mut self, path: &str, method: &Method) -> Option<Rc<Route>> {
        let idx = self
            .routes
            .iter()
            .position(|r| r.path() == path && r.method() == method)?;
        Some(self.routes.remove(idx))
    }

    fn lookup(&self, path: &str, method: &Method) -> Option<&Rc<Route>> {
        self.routes
            .iter()
            .find(|r| r.path() == path && r.method() == method)
    }

    pub fn get_route(&self, path: &str, method: &Method) -> Option<Rc<Route>> {
        self.lookup(path, method).cloned()
    }

    /// Router level middlewares, merged into the owning application by
    /// `add_router`.
    pub fn add_middleware(&mut self, middleware: MiddlewareFn) {
        self.middlewares.push(middleware);
    }

    pub(crate) fn middlewares(&self) -> &[MiddlewareFn] {
        &self.middlewares
    }

    /// Merge another router's routes into this one. The other router's
    /// prefix is already baked into its patterns. Fails on the first
    /// duplicate, leaving previously merged routes in place.
    pub fn merge(&mut self, other: Router) -> Result<(), Error> {
        for route in other.routes {
            self.add_registered(route)?;
        }
        self.middlewares.extend(other.middlewares);
        Ok(())
    }

    /// Resolve a request in registration order.
    ///
    /// The first pattern that matches the whole path wins if its method
    /// agrees; method mismatches accumulate into a 405 carrying the allowed
    /// set, and no pattern match at all is a 404.
    pub fn resolve(&self, method: &Method, path: &str) -> Result<(Params, Rc<Route>), Error> {
        let mut allow: Vec<Method> = Vec::new();

        for route in &self.routes {
            if let Some(params) = route.pattern.matches(path) {
                if route.method() == method {
                    return Ok((params, route.clone()));
                }
                if !allow.contains(route.method()) {
                    allow.push(route.method().clone());
                }
            }
        }

        if allow.is_empty() {
            Err(Error::NotFound { path: path.to_owned() })
        } else {
            Err(Error::MethodNotAllowed { allow })
        }
    }
}
