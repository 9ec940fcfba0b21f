//! # Observability
//!
//! - **Structured logging**: pretty or JSON output through `tracing-subscriber`
//! - **Request IDs**: an `x-request-id` on every HTTP request and response
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shelfcast_node::observability::{init_logging, request_id_middleware};
//!
//! init_logging("info", true);
//! let app: axum::Router<()> = axum::Router::new()
//!     .layer(axum::middleware::from_fn(request_id_middleware));
//! ```

mod logging;
pub mod middleware;

pub use logging::init_logging;
pub use middleware::{request_id_middleware, RequestId, REQUEST_ID_HEADER};
