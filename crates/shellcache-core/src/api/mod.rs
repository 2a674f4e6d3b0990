//! Request lifecycle layer for the admin API.
//!
//! This module provides the `ApiClient` (token injection, timing, error
//! classification, files, batch and health calls) and the reactive
//! resources built on top of it through the `Transport` trait.
//!
//! Authentication is a bearer token read from the `LocalStore` on every
//! request. A 401 evicts it.

pub mod client;
pub mod error;
pub mod infinite;
pub mod paginated;
pub mod resource;

pub use client::{
    cancellable, ApiClient, ApiRequest, ApiResponse, BatchResult, CancelHandle, LoggingNavigator, Navigator,
    ProgressFn, Transport,
};
pub use error::ApiError;
pub use infinite::InfiniteResource;
pub use paginated::{Page, PageOptions, PaginatedResource, Pagination};
pub use resource::{Endpoint, Resource, ResourceOptions, ResourceState};

pub use reqwest::Method;
