pub mod channel;
pub mod config;
pub mod error;
pub mod history;
pub mod model;
pub mod session;
pub mod test_support;
