pub mod adjacency;

pub use adjacency::Adjacency;
