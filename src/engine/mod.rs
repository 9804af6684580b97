// Engine orchestration: buffer state, chunk download loop, and session lifecycle.

pub mod buffer;
pub mod downloader;
pub mod session;
pub mod stats;
