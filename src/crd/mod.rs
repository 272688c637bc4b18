//! Custom Resource Definitions for the AppService operator

mod app_service;


pub use app_service::{AppService, AppServiceSpec, AppServiceStatus};
