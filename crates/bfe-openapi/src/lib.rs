//! Client for the BFE open-api product pool endpoints
//!
//! The open-api exposes instance pools under a product:
//!
//! - `GET /open-api/v1/products/{product}/instance-pools` - List pool names
//! - `GET /open-api/v1/products/{product}/instance-pools/{pool}` - Fetch a pool
//! - `POST /open-api/v1/products/{product}/instance-pools` - Create a pool
//! - `PATCH /open-api/v1/products/{product}/instance-pools/{pool}` - Replace pool members
//! - `DELETE /open-api/v1/products/{product}/instance-pools/{pool}` - Delete a pool
//!
//! Every response is wrapped in an envelope carrying a logical status code,
//! a message, and a data payload. See [`ApiResponse`].

mod client;
mod error;
mod types;

pub use client::{OpenApiClient, API_VERSION};
pub use error::ApiError;
pub use types::{ApiResponse, Instance, PoolResponse, UpsertParam, DEFAULT_PORT_KEY};
