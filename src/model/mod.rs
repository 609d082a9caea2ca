pub mod config;
pub mod counters;
pub mod event;
pub mod task;
pub mod view;

pub use config::*;
pub use counters::*;
pub use event::*;
pub use task::*;
pub use view::*;
