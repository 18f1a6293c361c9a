//! Tools: definitions, the enabled-tool registry, native handlers and the
//! dispatcher over the four back-end kinds.

pub mod dispatcher;
pub mod errors;
pub mod native;
pub mod registry;
pub mod types;

pub use dispatcher::{validate_arguments, KnowledgeExecutor, ToolDispatcher};
pub use errors::ToolError;
pub use native::{NativeHandler, NativeHandlerRegistry};
pub use registry::{KnowledgeBackend, ToolRegistry};
pub use types::{
    HttpMethod, RiskLevel, ToolCallContext, ToolConfig, ToolExecution, ToolImplementation,
};
