// =============================================================================
// Bitunix futures API
// =============================================================================

pub mod client;
pub mod error;

pub use client::BitunixClient;
pub use error::{ApiError, ErrorKind};
