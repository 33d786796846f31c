pub mod api;
pub mod controller;
pub mod models;

pub use api::{HttpPollApi, PollApi};
pub use controller::*;
pub use models::*;
