//! 工具层：Tool trait、注册表、闭包适配与带超时审计的执行器

pub mod echo;
pub mod executor;
pub mod registry;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{FnTool, Tool, ToolRegistry};
