pub mod batch;
pub mod commands;
pub mod run;
pub mod runtime;
pub mod status;

pub use batch::{cmd_batch, BatchArgs};
pub use commands::{Cli, Commands};
pub use run::{cmd_run, RunArgs};
pub use status::{cmd_status, StatusArgs};
