pub mod config;
pub mod error;
pub mod feed;
pub mod realtime;
pub mod results;
pub mod sse;
pub mod startup;
pub mod timer;
