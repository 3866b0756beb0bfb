pub mod mark_price_stream;

pub use mark_price_stream::run_mark_price_stream;
