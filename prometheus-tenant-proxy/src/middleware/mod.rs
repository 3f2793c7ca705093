pub mod auth;
pub mod log;

pub use auth::auth_middleware;
pub use log::log_middleware;
