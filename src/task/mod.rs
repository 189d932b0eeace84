pub(crate) mod engine;
pub mod events;
pub mod execution;
pub mod manager;
pub mod process;
pub mod report;
pub mod resolver;
pub mod types;


pub use events::*;
pub use execution::*;
pub use manager::*;
pub use process::*;
pub use report::*;
pub use resolver::*;
pub use types::*;
