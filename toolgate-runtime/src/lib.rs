pub mod error;
pub mod invoker;
pub mod limits;
pub mod output;
pub mod process;
pub mod tools;

pub use error::InvokeError;
pub use invoker::{StatusHook, ToolInvoker, ToolOutput};
pub use limits::ExecutionLimits;
pub use output::{CappedText, Spool};
