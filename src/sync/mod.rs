pub mod api;
pub mod broadcast;
pub mod ingest;
pub mod offline;
pub mod optimistic;

pub use api::*;
pub use broadcast::*;
pub use ingest::*;
pub use offline::*;
pub use optimistic::*;
