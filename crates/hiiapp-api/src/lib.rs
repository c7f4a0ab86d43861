pub mod auth;
pub mod documents;
pub mod error;
pub mod identity;
pub mod middleware;
pub mod routes;

pub use identity::{CodeSender, IdentityConfig, IdentityService};
pub use routes::{AppState, AppStateInner, router};
