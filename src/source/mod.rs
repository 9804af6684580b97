// Origin access: the chunk source seam and its HTTP implementation.

pub mod http_source;
pub mod traits;
