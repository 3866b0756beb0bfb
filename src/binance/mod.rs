pub mod client;
pub mod user_stream;

pub use client::BinanceFuturesClient;
