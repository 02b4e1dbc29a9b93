pub mod graph;

pub use graph::{discover, DiscoveredRelation};
