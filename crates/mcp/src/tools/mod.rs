pub mod find;
mod registry;

pub use find::{
    register_search_tools, FindAllFilesTool, FindFileTool, FindJarTool, SearchScope,
};
pub use registry::{json_schema_object, json_schema_string, Tool, ToolRegistry};
