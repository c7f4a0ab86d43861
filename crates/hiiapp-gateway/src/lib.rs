pub mod connection;
pub mod dispatcher;
pub mod store;

pub use store::LocalStore;
