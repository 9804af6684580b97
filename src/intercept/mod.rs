// Interception layer: decides which player requests can be served from the buffer.

pub mod filter;
pub mod interceptor;
