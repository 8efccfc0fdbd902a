pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use auth::{Credentials, TokenAuthority};
pub use client::OpendoorsClient;
pub use config::Config;
pub use error::{Error, Result};
pub use models::{LockActionType, LockAttributes, LockMap, LockState, Token};
pub use session::{SessionManager, SessionOptions};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
