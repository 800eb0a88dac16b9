mod exposition;
mod flatten;

pub use exposition::render;
pub use flatten::{flatten, series_count};

#[cfg(test)]
pub use exposition::parse_samples;
