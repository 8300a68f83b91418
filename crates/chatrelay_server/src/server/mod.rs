#![forbid(unsafe_code)]

pub mod acceptor;
pub mod auth;
pub mod bridge;
pub mod connection;
pub mod deliverable;
pub mod dispatch;
pub mod filter;
pub mod health;
pub mod identity;
pub mod registry;
pub mod relay;
pub mod router;
