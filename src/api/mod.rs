// Host-facing entry points.

pub mod simple;
