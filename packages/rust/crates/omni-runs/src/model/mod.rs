//! Data model: runs, transcript messages, tool contracts, model descriptors.

mod descriptor;
mod message;
mod run;
mod tool;

pub use descriptor::{ModelDescriptor, NewModel, Provider};
pub use message::{Message, MessageRole, NewMessage, ToolCall};
pub use run::{NewRun, Run, RunStatus};
pub use tool::{NewToolContract, ToolContract};
