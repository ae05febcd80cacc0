pub mod auth;

pub use auth::SimpleAuthenticator;
