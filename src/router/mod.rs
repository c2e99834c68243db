//! Request routing: map exact paths and HTTP methods to handler functions.
//!
//! Trailing slashes are normalized on both registered paths and incoming
//! paths, so `/api/ask/` and `/api/ask` are treated as equivalent.
//!
//! Dispatch outcome:
//!
//! | Situation                          | Response                         |
//! |------------------------------------|----------------------------------|
//! | method and path match              | the route's handler              |
//! | path matches, method does not      | `405 Method Not Allowed` + `Allow` |
//! | no route for the path              | `404 Not Found`                  |
//!
//! Every dispatch runs through the middleware stack registered with
//! [`Router::layer`], outermost first.

use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::middleware::{Middleware, MiddlewareHandler, Next, from_middleware};
use crate::{Method, Request, Response, StatusCode};

/// Type-erased, heap-allocated async handler that processes a [`Context`] and returns a
/// [`Response`].
pub type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait automatically via the blanket impl
/// below.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(ctx))
    }
}

fn normalize(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

struct Route {
    method: Method,
    path: String,
    handler: Handler,
}

/// HTTP request router.
///
/// # Examples
///
/// ```rust,no_run
/// use promptrelay::context::Context;
/// use promptrelay::{Router, Response, StatusCode};
///
/// let mut router = Router::new();
/// router.get("/healthz", |_ctx: Context| async { Response::new(StatusCode::Ok).body("ok") });
/// router.post("/api/ask", |_ctx: Context| async { Response::new(StatusCode::Ok) });
/// ```
pub struct Router {
    routes: Vec<Route>,
    middlewares: Vec<MiddlewareHandler>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            middlewares: Vec::new(),
        }
    }

    /// Register a handler for `GET` requests to `path`.
    pub fn get(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Get, path, handler);
    }

    /// Register a handler for `POST` requests to `path`.
    pub fn post(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Post, path, handler);
    }

    /// Append a middleware. Middleware run in registration order, wrapping
    /// both matched handlers and the 404/405 fallbacks.
    pub fn layer<M: Middleware + 'static>(&mut self, middleware: M) {
        self.middlewares.push(from_middleware(Arc::new(middleware)));
    }

    fn add_route(&mut self, method: Method, path: &str, handler: impl IntoHandler) {
        let handler: Handler = Arc::new(move |ctx| handler.call(ctx));
        self.routes.push(Route {
            method,
            path: normalize(path).to_owned(),
            handler,
        });
    }

    /// Return the number of routes registered in this router.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatch `request` through the middleware stack to the matching route.
    pub async fn route(&self, request: Request) -> Response {
        let endpoint = self.endpoint_for(request.method(), request.path());
        let mut chain = self.middlewares.clone();
        chain.push(Arc::new(move |ctx: Context, _next: Next| endpoint(ctx)));

        Next::new(chain).run(Context::new(request)).await
    }

    // Resolve the handler for a method/path pair, or a 404/405 fallback.
    fn endpoint_for(&self, method: &Method, path: &str) -> Handler {
        let path = normalize(path);
        let mut allowed: Vec<&str> = Vec::new();

        for route in &self.routes {
            if route.path != path {
                continue;
            }
            if &route.method == method {
                return Arc::clone(&route.handler);
            }
            allowed.push(route.method.as_str());
        }

        if allowed.is_empty() {
            return Arc::new(|_ctx| Box::pin(async { Response::new(StatusCode::NotFound) }));
        }

        let allow = allowed.join(", ");
        Arc::new(move |_ctx| {
            let allow = allow.clone();
            Box::pin(async move {
                Response::new(StatusCode::MethodNotAllowed).header("Allow", allow)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_request(method: &str, path: &str) -> Request {
        let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        req
    }

    #[test]
    fn router_starts_empty() {
        let router = Router::default();
        assert!(router.is_empty());
        assert_eq!(router.len(), 0);
    }

    #[tokio::test]
    async fn empty_router_returns_404() {
        let router = Router::new();
        let res = router.route(make_request("GET", "/")).await;
        assert_eq!(res.status(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn post_matches() {
        let mut router = Router::new();
        router.post("/api/ask", |_ctx| async { Response::new(StatusCode::Ok) });
        let res = router.route(make_request("POST", "/api/ask")).await;
        assert_eq!(res.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn trailing_slash_is_normalized() {
        let mut router = Router::new();
        router.post("/api/ask/", |_ctx| async { Response::new(StatusCode::Ok) });
        let res = router.route(make_request("POST", "/api/ask")).await;
        assert_eq!(res.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn wrong_method_returns_405_with_allow() {
        let mut router = Router::new();
        router.post("/api/ask", |_ctx| async { Response::new(StatusCode::Ok) });
        let res = router.route(make_request("GET", "/api/ask")).await;
        assert_eq!(res.status(), StatusCode::MethodNotAllowed);
        assert_eq!(res.headers().get("allow"), Some("POST"));
    }

    #[tokio::test]
    async fn first_matching_route_wins() {
        let mut router = Router::new();
        router.get("/path", |_ctx| async { Response::new(StatusCode::Ok) });
        router.get("/path", |_ctx| async { Response::new(StatusCode::NoContent) });
        let res = router.route(make_request("GET", "/path")).await;
        assert_eq!(res.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn handler_sees_request_context() {
        let mut router = Router::new();
        router.get("/whoami", |ctx: Context| async move {
            Response::new(StatusCode::Ok).body(ctx.request().path().to_owned())
        });
        let res = router.route(make_request("GET", "/whoami")).await;
        let wire = String::from_utf8(res.into_bytes().to_vec()).unwrap();
        assert!(wire.ends_with("/whoami"));
    }

    struct Stamp;

    impl Middleware for Stamp {
        fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
            Box::pin(async move {
                let mut res = next.run(ctx).await;
                res.add_header("X-Stamp", "1");
                res
            })
        }
    }

    #[tokio::test]
    async fn middleware_wraps_handlers_and_fallbacks() {
        let mut router = Router::new();
        router.layer(Stamp);
        router.get("/a", |_ctx| async { Response::new(StatusCode::Ok) });

        let hit = router.route(make_request("GET", "/a")).await;
        assert_eq!(hit.headers().get("x-stamp"), Some("1"));

        let miss = router.route(make_request("GET", "/b")).await;
        assert_eq!(miss.status(), StatusCode::NotFound);
        assert_eq!(miss.headers().get("x-stamp"), Some("1"));
    }
}
