pub mod store;

pub use store::{AttachedStatement, CaptureStore, DependencyNode, IndexRecord, PolicyRecord};
