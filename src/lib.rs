//! NutriSignal client core: photo classification, auth/session state, and
//! scan history, driven by headless screens.

pub mod auth;
pub mod backend;
pub mod classifier;
pub mod config;
pub mod error;
pub mod screens;
pub mod session;
pub mod state;

pub use error::AppError;
pub use state::App;
