//! Rate limiting gateway built on bucketgate.
//!
//! Admitted `/api/**` requests are forwarded to the configured upstream with the
//! `/api` segment stripped; rejected ones get a 429 from the admission layer.

pub mod error;
pub mod proxy;
pub mod router;
pub mod server;
pub mod settings;

pub use error::GatewayError;
pub use proxy::Upstream;
pub use router::{build_router, AppState};
pub use settings::{GatewaySettings, StoreKind};
