mod events;
mod status;
pub mod template;

pub use events::*;
pub use status::*;
pub use template::{TemplateError, TemplateValidation, TemplateVariable, VariableType};
