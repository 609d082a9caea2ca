pub mod debounce;
pub mod settle;
pub mod task_store;

pub use debounce::*;
pub use settle::*;
pub use task_store::*;
