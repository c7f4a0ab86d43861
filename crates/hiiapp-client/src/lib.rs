//! Client core of the hiiapp one-to-one chat.
//!
//! The [`session::Session`], [`directory::ConversationDirectory`] and
//! [`thread::ConversationThread`] components talk to the backend only
//! through the [`backend::DataStore`] and [`backend::IdentityProvider`]
//! traits. [`local`] runs the backend in process, [`remote`] talks to a
//! `hiiapp-server` over HTTP and WebSockets.

pub mod backend;
pub mod chat;
pub mod config;
pub mod credentials;
pub mod directory;
pub mod error;
pub mod local;
pub mod remote;
pub mod session;
pub mod shell;
pub mod thread;

pub use backend::{DataStore, IdentityProvider};
pub use config::{ClientConfig, PlatformConfig};
pub use error::ClientError;
