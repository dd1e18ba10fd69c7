//! bfe-service-controller: keeps BFE product pools in sync with Kubernetes Services

pub mod config;
pub mod controllers;
pub mod desired;
pub mod events;
pub mod finalizer;
pub mod gateway;
pub mod health;
pub mod ledger;
pub mod model;
pub mod naming;
pub mod recorder;
pub mod store;

pub use config::ControllerOptions;
pub use controllers::ControllerContext;
