pub mod app;
pub mod cancel;
pub mod config;
pub mod error;
pub mod handlers;
pub mod normalize;
pub mod relay;
pub mod upstream;
pub mod writer;
