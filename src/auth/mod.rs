//! Token signing for the local backend and email checks for the login form.

pub mod jwt;
pub mod validate;

pub use jwt::{JwtKeys, TokenKind};
