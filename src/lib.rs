//! # promptrelay
//!
//! A streaming prompt relay on a small async HTTP/1.1 server.
//!
//! The server side ([`relay`]) accepts `POST /api/ask` with a prompt and an
//! optional previous answer, opens a streaming chat completion upstream
//! ([`llm`]), and re-emits the text deltas as a chunked response body. The
//! client side ([`client`]) runs one exchange at a time against the relay and
//! reports the accumulated text as it grows.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use promptrelay::llm::OpenAiCompatibleProvider;
//! use promptrelay::relay::{EnvCredential, RelayHandler};
//! use promptrelay::{Router, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = OpenAiCompatibleProvider::new("https://api.thesys.dev/v1/embed", Duration::from_secs(10))?;
//!     let relay = RelayHandler::new(Arc::new(provider), Arc::new(EnvCredential::new("THESYS_API_KEY")));
//!
//!     let mut router = Router::new();
//!     Arc::new(relay).mount(&mut router, "/api/ask");
//!     let router = Arc::new(router);
//!
//!     let server = Server::bind("127.0.0.1:3000").await?;
//!     server
//!         .run(move |req| {
//!             let router = Arc::clone(&router);
//!             async move { router.route(req).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod http;
pub mod llm;
pub mod middleware;
pub mod relay;
pub mod router;
pub mod server;

pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::Router;
pub use server::{Server, ServerError};
