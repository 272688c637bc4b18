//! appservice-operator: Kubernetes operator for AppService resources
//!
//! Each AppService is reconciled into a Deployment running its image and a
//! NodePort Service exposing its ports. An optional admission webhook
//! defaults image tags and replica counts before objects are stored.

pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;
pub mod webhook;

pub use crate::error::{Error, Result};
