pub mod ast;
pub mod condition;
pub mod error;
pub mod matcher;
pub mod module;
pub mod parser;
pub mod registry;
pub mod settings;
pub mod solution;
pub mod template;
pub mod variables;

pub use ast::Document;
pub use error::{CompileError, Result};
pub use module::{Module, Project};
pub use solution::{Configuration, Solution, SolutionBuilder};
pub use template::Template;
