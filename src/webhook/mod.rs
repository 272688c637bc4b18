//! Admission webhook for AppService resources
//!
//! - **Defaulting** ([`mutation`]): tags images and repairs replica counts
//! - **Guard** ([`validation`]): replica correction, never rejects
//! - **Server** ([`server`]): axum endpoints for `/mutate` and `/validate`

pub mod mutation;
#[cfg(feature = "admission-webhook")]
pub mod server;
pub mod validation;

pub use mutation::{apply_mutations, default_image};
#[cfg(feature = "admission-webhook")]
pub use server::{TlsConfig, WebhookServer};
pub use validation::{guard_replicas, validate, DEFAULT_REPLICAS};
