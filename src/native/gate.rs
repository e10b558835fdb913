use std::collections::HashSet;

use rustpython_parser::{Parse, ast};

use crate::{
    constants::DEFAULT_DENYLIST,
    core::{errors::GateRejection, traits::gate::Gate},
};

/// Rejects Python sources that import a denylisted top-level module.
///
/// Only `import x` and `from x import y` statements are inspected, at any
/// nesting depth. `__import__`, `importlib`, `getattr` tricks and the like
/// pass straight through, so this is an advisory filter and nothing more.
#[derive(Clone, Debug)]
pub struct PythonImportGate {
    denylist: HashSet<String>,
}

impl PythonImportGate {
    pub fn new<I, S>(denylist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            denylist: denylist.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for PythonImportGate {
    fn default() -> Self {
        Self::new(DEFAULT_DENYLIST.iter().copied())
    }
}

impl Gate for PythonImportGate {
    fn check(&self, source: &str) -> Result<(), GateRejection> {
        let suite = ast::Suite::parse(source, "<artifact>")
            .map_err(|e| GateRejection::Unparseable { msg: e.to_string() })?;

        let mut imported = Vec::new();
        collect_imports(&suite, &mut imported);

        match imported
            .into_iter()
            .map(top_level)
            .find(|module| self.denylist.contains(*module))
        {
            Some(module) => {
                tracing::debug!(module, "artifact imports a denied module");
                Err(GateRejection::DeniedImport {
                    module: module.to_string(),
                })
            }
            None => Ok(()),
        }
    }
}

fn top_level(module: &str) -> &str {
    module.split_once('.').map_or(module, |(head, _)| head)
}

fn collect_imports<'a>(body: &'a [ast::Stmt], out: &mut Vec<&'a str>) {
    for stmt in body {
        match stmt {
            ast::Stmt::Import(ast::StmtImport { names, .. }) => {
                out.extend(names.iter().map(|alias| alias.name.as_str()));
            }
            // `from . import x` names no module of its own.
            ast::Stmt::ImportFrom(ast::StmtImportFrom {
                module: Some(module),
                ..
            }) => out.push(module.as_str()),
            ast::Stmt::FunctionDef(ast::StmtFunctionDef { body, .. })
            | ast::Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef { body, .. })
            | ast::Stmt::ClassDef(ast::StmtClassDef { body, .. })
            | ast::Stmt::With(ast::StmtWith { body, .. })
            | ast::Stmt::AsyncWith(ast::StmtAsyncWith { body, .. }) => collect_imports(body, out),
            ast::Stmt::For(ast::StmtFor { body, orelse, .. })
            | ast::Stmt::AsyncFor(ast::StmtAsyncFor { body, orelse, .. })
            | ast::Stmt::While(ast::StmtWhile { body, orelse, .. })
            | ast::Stmt::If(ast::StmtIf { body, orelse, .. }) => {
                collect_imports(body, out);
                collect_imports(orelse, out);
            }
            ast::Stmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            })
            | ast::Stmt::TryStar(ast::StmtTryStar {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            }) => {
                collect_imports(body, out);
                for handler in handlers {
                    match handler {
                        ast::ExceptHandler::ExceptHandler(handler) => {
                            collect_imports(&handler.body, out)
                        }
                    }
                }
                collect_imports(orelse, out);
                collect_imports(finalbody, out);
            }
            ast::Stmt::Match(ast::StmtMatch { cases, .. }) => {
                for case in cases {
                    collect_imports(&case.body, out);
                }
            }
            _ => {}
        }
    }
}
