//! Method and path routing for text messages.
//!
//! A request message starts with `METHOD /path` on its first line; anything after the first
//! newline is the body. Replies start with `<status> <reason>`, followed by a newline and the
//! body.

use std::{collections::HashMap, fmt};

type Handler = Box<dyn Fn(&Request<'_>) -> Response + Send + Sync>;

/// A routed text message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub body: &'a str,
}

impl<'a> Request<'a> {
    /// `None` unless the first line is exactly a method and a path starting with `/`.
    #[must_use]
    pub fn parse(text: &'a str) -> Option<Self> {
        let (line, body) = text.split_once('\n').unwrap_or((text, ""));
        let mut parts = line.trim_end_matches('\r').split_whitespace();
        let method = parts.next()?;
        let path = parts.next().filter(|p| p.starts_with('/'))?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { method, path, body })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub body: String,
}

impl Response {
    pub fn new(status: u16, reason: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<String>) -> Self { Self::new(200, "OK", body) }

    #[must_use]
    pub fn bad_request() -> Self { Self::new(400, "Bad Request", "") }

    #[must_use]
    pub fn not_found() -> Self { Self::new(404, "Not Found", "") }

    #[must_use]
    pub fn method_not_allowed() -> Self { Self::new(405, "Method Not Allowed", "") }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}\n{}", self.status, self.reason, self.body)
    }
}

/// Maps `(method, path)` to a handler.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Vec<(String, Handler)>>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Adds a route. Methods compare case-insensitively, paths exactly.
    #[must_use]
    pub fn route(
        mut self,
        method: &str,
        path: &str,
        handler: impl Fn(&Request<'_>) -> Response + Send + Sync + 'static,
    ) -> Self {
        self.routes
            .entry(path.to_string())
            .or_default()
            .push((method.to_ascii_uppercase(), Box::new(handler)));
        self
    }

    #[must_use]
    pub fn get(self, path: &str, handler: impl Fn(&Request<'_>) -> Response + Send + Sync + 'static) -> Self {
        self.route("GET", path, handler)
    }

    #[must_use]
    pub fn post(self, path: &str, handler: impl Fn(&Request<'_>) -> Response + Send + Sync + 'static) -> Self {
        self.route("POST", path, handler)
    }

    /// Routes one text message. Unknown paths get 404, known paths with another method 405.
    #[must_use]
    pub fn dispatch(&self, text: &str) -> Response {
        let Some(req) = Request::parse(text) else {
            tracing::debug!("unroutable text message");
            return Response::bad_request();
        };
        let Some(handlers) = self.routes.get(req.path) else {
            return Response::not_found();
        };
        match handlers.iter().find(|(m, _)| m.eq_ignore_ascii_case(req.method)) {
            Some((_, handler)) => {
                let resp = handler(&req);
                tracing::debug!(method = req.method, path = req.path, status = resp.status, "routed");
                resp
            }
            None => Response::method_not_allowed(),
        }
    }
}
