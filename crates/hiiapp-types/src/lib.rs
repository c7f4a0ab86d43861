pub mod api;
pub mod challenge;
pub mod error;
pub mod events;
pub mod models;
pub mod store;
pub mod subscription;
