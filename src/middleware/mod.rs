//! Middleware pipeline for inbound requests.
//!
//! A [`Stack`] is an ordered list of [`MiddlewareHandler`]s ending in an
//! endpoint. Each layer receives the request [`Context`] and a [`Next`] cursor;
//! it may pass the request on, answer it directly (the gate's 429 and 401), or
//! decorate the response coming back (hardening headers, access logging).
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by every layer.
//! - [`Next`]: cursor into the rest of the chain.
//! - [`MiddlewareHandler`]: type-erased, cheaply cloneable layer.
//! - [`Stack`]: builder that freezes into a [`Pipeline`] the server dispatches to.
//! - [`LoggerMiddleware`]: access log.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Request, Response, StatusCode, context::Context};

/// Boxed future every layer returns.
pub type BoxResponse = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A type-erased, reference-counted middleware function.
///
/// Construct one with [`from_middleware`], [`from_handler`] or by wrapping a
/// closure directly:
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use upguard::{context::Context, middleware::{BoxResponse, MiddlewareHandler, Next}};
///
/// let handler: MiddlewareHandler = Arc::new(|ctx: Context, next: Next| -> BoxResponse {
///     Box::pin(async move { next.run(ctx).await })
/// });
/// ```
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> BoxResponse + Send + Sync + 'static>;

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so a layer can forward a request at
/// most once.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    index: usize,
}

impl Next {
    /// A cursor at the first handler of `middlewares`.
    pub fn new(middlewares: impl Into<Arc<[MiddlewareHandler]>>) -> Self {
        Self {
            middlewares: middlewares.into(),
            index: 0,
        }
    }

    /// Invokes the next layer. An exhausted chain answers `500`.
    pub async fn run(mut self, ctx: Context) -> Response {
        match self.middlewares.get(self.index).cloned() {
            Some(handler) => {
                self.index += 1;
                handler(ctx, self).await
            }
            None => Response::new(StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline"),
        }
    }
}

/// The core trait for all middleware.
///
/// Implementations are shared across tasks, so they must be `Send + Sync` and
/// return a `Send` future.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse;
}

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// Wraps a terminal handler; it never calls the rest of the chain.
pub fn from_handler<H, F>(handler: H) -> MiddlewareHandler
where
    H: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |ctx: Context, _next: Next| -> BoxResponse { Box::pin(handler(ctx)) })
}

/// An ordered middleware pipeline.
///
/// ```rust,no_run
/// use upguard::middleware::{LoggerMiddleware, Stack};
/// use upguard::{Response, StatusCode};
///
/// let stack = Stack::new()
///     .layer(LoggerMiddleware)
///     .endpoint(|_ctx| async { Response::new(StatusCode::Ok).body("pong") });
/// ```
#[derive(Clone, Default)]
pub struct Stack {
    layers: Vec<MiddlewareHandler>,
}

impl Stack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware; layers run in the order they are added.
    #[must_use]
    pub fn layer<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.layers.push(from_middleware(Arc::new(middleware)));
        self
    }

    /// Appends an already type-erased layer.
    #[must_use]
    pub fn handler(mut self, handler: MiddlewareHandler) -> Self {
        self.layers.push(handler);
        self
    }

    /// Terminates the pipeline with `handler` and freezes it.
    pub fn endpoint<H, F>(mut self, handler: H) -> Pipeline
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        self.layers.push(from_handler(handler));
        Pipeline {
            layers: self.layers.into(),
        }
    }
}

/// A frozen [`Stack`], cheap to clone and share between connections.
#[derive(Clone)]
pub struct Pipeline {
    layers: Arc<[MiddlewareHandler]>,
}

impl Pipeline {
    /// Runs `request` through every layer.
    pub async fn handle(&self, request: Request) -> Response {
        Next::new(Arc::clone(&self.layers))
            .run(Context::new(request))
            .await
    }
}

/// Access log: one `tracing` event per request with method, path, status and
/// latency.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().clone();
            let path = ctx.request().path().to_string();

            let response = next.run(ctx).await;

            tracing::info!(
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "request handled"
            );
            response
        })
    }
}
