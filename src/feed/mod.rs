pub mod models;
pub use models::*;

mod transport;
pub use transport::*;

mod client;
pub use client::*;

pub mod local;
pub mod phoenix;

pub use local::LocalChangeFeed;
pub use phoenix::PhoenixTransport;
