pub mod channel;
pub mod web;

pub use channel::ChannelSourceReader;
pub use web::WebSourceReader;
