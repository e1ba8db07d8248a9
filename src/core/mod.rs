pub mod context;
pub mod prompts;
pub mod registry;
pub mod template;
