//! Pipeline configuration: types, YAML parsing, environment loading and
//! semantic validation.

pub mod env;
pub mod parser;
pub mod types;
pub mod validator;
