pub mod types;
pub mod auth;

pub use types::*;
pub use auth::BybitAuth;
