pub mod embedder;
pub mod retrieve;
pub mod session;
