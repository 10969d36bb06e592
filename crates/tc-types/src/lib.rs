pub mod approval;
pub mod config;
pub mod event;
pub mod message;
pub mod policy;
pub mod session;
