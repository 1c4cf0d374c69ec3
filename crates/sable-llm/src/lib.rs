pub mod adapter;
pub mod anthropic;
pub mod mock;
pub mod models;
pub mod sse;
