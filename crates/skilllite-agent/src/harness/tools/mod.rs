pub mod base;
pub mod builtin;
pub mod registry;

pub use base::Tool;
pub use registry::ToolRegistry;
