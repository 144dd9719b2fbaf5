//! A VCL interpreter and the caching reverse proxy that runs it.

pub mod acl;
pub mod cache;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod expr;
pub mod health;
pub mod interpreter;
pub mod parse_probe;
pub mod parser;
pub mod pipeline;
pub mod registry;
pub mod scanner;
pub mod server;
pub mod stdlib;
pub mod value;

use std::sync::Arc;

use error::LoadError;
use interpreter::CompiledProgram;
use registry::Registry;

/// A compiled program together with the objects it declares.
#[derive(Debug, Clone)]
pub struct Vcl {
    pub program: Arc<CompiledProgram>,
    pub registry: Arc<Registry>,
}

impl Vcl {
    pub fn from_program(program: &expr::Program) -> Result<Vcl, LoadError> {
        let registry = Registry::from_program(program)?;
        Ok(Vcl {
            program: Arc::new(CompiledProgram::compile(program)),
            registry: Arc::new(registry),
        })
    }
}

/// Scans, parses and compiles `source`.
pub fn load(source: &str) -> Result<Vcl, LoadError> {
    let program = parser::parse(scanner::scan_tokens(source))?;
    Vcl::from_program(&program)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load() {
        let vcl = load(
            r#"
            backend origin { .host = "127.0.0.1"; .port = "8081"; }
            sub vcl_recv { set req.http.X-Seen = "1"; }
            "#,
        )
        .unwrap();
        assert!(vcl.program.has("vcl_recv"));
        assert!(vcl.registry.has_backend("origin"));
    }

    #[test]
    fn test_load_errors() {
        assert!(matches!(load("sub vcl_recv {"), Err(LoadError::Parse(_))));
        assert!(matches!(
            load("backend nohost { .port = \"80\"; }"),
            Err(LoadError::Declaration { .. })
        ));
    }
}
