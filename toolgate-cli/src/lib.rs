pub mod cli_args;
pub mod pipe;

pub use cli_args::ArgsValidationError;
pub use cli_args::ToolgateCli;
pub use pipe::PipeCall;
pub use pipe::handle_line;
pub use pipe::serve;
