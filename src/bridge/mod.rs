//! Telegram -> WhatsApp message flow.
//!
//! ## Module Structure
//!
//! - `channels`: Communication channel structures
//! - `normalizer`: Inbound event to forward task mapping
//! - `filter`: Keyword, pattern, author and content-type filters
//! - `orchestrator`: The pipeline feeding the delivery engine

pub mod channels;
pub mod filter;
pub mod normalizer;
pub mod orchestrator;

pub use channels::ChannelBundle;
pub use orchestrator::Pipeline;
