//! Import resolution
//!
//! Resolves `import "path"` and `import name as alias` statements, loading
//! and parsing each imported file once and merging its statements ahead of
//! the importing program's own, so imported definitions are in scope before
//! first use.
//!
//! Library imports probe, in order: the installed library directory
//! (`FLAP_LIB_DIR`, falling back to `/usr/local/share/flap/lib`), a path
//! relative to the importing file, then the git cache under the user's
//! cache directory. No network access happens here; populating the git
//! cache is the driver's business.
//!
//! Double-includes are prevented by canonical-path tracking. Aliases are
//! accepted and recorded but the namespace is flat; an alias does not
//! rename the imported definitions.

use crate::ast::{Import, Program, Stmt};
use crate::error::{CompileError, ErrorKind, Result, Span};
use crate::parser::Parser;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub struct Importer {
    /// Canonical paths already merged.
    seen: HashSet<PathBuf>,
    /// Continues the main program's lambda/loop id sequence.
    next_id: usize,
}

/// Merge all imports of `program` (recursively) into one program.
/// `source_path` is the file `program` was parsed from; `next_id` is the
/// first free lambda/loop id after parsing it.
pub fn resolve_imports(
    program: Program,
    source_path: &Path,
    next_id: usize,
) -> Result<Program> {
    let mut importer = Importer { seen: HashSet::new(), next_id };
    if let Ok(canonical) = source_path.canonicalize() {
        importer.seen.insert(canonical);
    }
    let mut merged_stmts: Vec<Stmt> = Vec::new();
    let base_dir = source_path.parent().unwrap_or(Path::new(".")).to_path_buf();
    for import in &program.imports {
        importer.merge_import(import, &base_dir, &mut merged_stmts)?;
    }
    merged_stmts.extend(program.stmts);
    Ok(Program {
        imports: Vec::new(),
        stmts: merged_stmts,
        file: program.file,
    })
}

impl Importer {
    fn merge_import(
        &mut self,
        import: &Import,
        base_dir: &Path,
        out: &mut Vec<Stmt>,
    ) -> Result<()> {
        let (path, span) = match import {
            Import::Path { path, span } => (self.find_relative(path, base_dir, *span)?, *span),
            Import::Lib { name, span, .. } => (self.find_library(name, base_dir, *span)?, *span),
        };

        let canonical = path.canonicalize().map_err(|e| {
            CompileError::new(
                ErrorKind::Parse,
                span,
                format!("cannot resolve import {}: {}", path.display(), e),
            )
        })?;
        if !self.seen.insert(canonical.clone()) {
            return Ok(()); // already merged
        }

        let source = std::fs::read_to_string(&canonical).map_err(|e| {
            CompileError::new(
                ErrorKind::Parse,
                span,
                format!("cannot read import {}: {}", canonical.display(), e),
            )
        })?;
        let mut parser = Parser::with_first_id(&source, self.next_id)?;
        let mut program = parser
            .parse()
            .map_err(|e| e.with_file(&canonical))?;
        self.next_id = parser.next_id();
        program.file = canonical.clone();

        // Depth-first: an import's own imports land before it.
        let child_dir = canonical.parent().unwrap_or(Path::new(".")).to_path_buf();
        for child in &program.imports {
            self.merge_import(child, &child_dir, out)?;
        }
        out.extend(program.stmts);
        Ok(())
    }

    fn find_relative(&self, path: &str, base_dir: &Path, span: Span) -> Result<PathBuf> {
        let candidate = base_dir.join(path);
        if candidate.is_file() {
            return Ok(candidate);
        }
        // Also accept the bare name with the extension added
        let with_ext = base_dir.join(format!("{}.flap", path));
        if with_ext.is_file() {
            return Ok(with_ext);
        }
        Err(CompileError::new(
            ErrorKind::Parse,
            span,
            format!("imported file '{}' not found under {}", path, base_dir.display()),
        ))
    }

    /// `import name`: installed library, then local path, then git cache.
    fn find_library(&self, name: &str, base_dir: &Path, span: Span) -> Result<PathBuf> {
        let mut candidates = Vec::new();
        let installed = std::env::var_os("FLAP_LIB_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/usr/local/share/flap/lib"));
        candidates.push(installed.join(format!("{}.flap", name)));
        candidates.push(base_dir.join(format!("{}.flap", name)));
        if let Some(home) = std::env::var_os("HOME") {
            candidates.push(
                PathBuf::from(home)
                    .join(".cache/flap/git")
                    .join(name)
                    .join(format!("{}.flap", name)),
            );
        }
        for candidate in &candidates {
            if candidate.is_file() {
                return Ok(candidate.clone());
            }
        }
        Err(CompileError::new(
            ErrorKind::Parse,
            span,
            format!("library '{}' not found (tried installed dir, local path, git cache)", name),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn parse_file(path: &Path) -> (Program, usize) {
        let source = fs::read_to_string(path).unwrap();
        let mut parser = Parser::new(&source).unwrap();
        let mut program = parser.parse().unwrap();
        program.file = path.to_path_buf();
        (program, parser.next_id())
    }

    #[test]
    fn test_relative_import_merges_before_main() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "util.flap", "helper = x => x * 2");
        let main = write(dir.path(), "main.flap", "import \"util.flap\"\ny = helper(21)");
        let (program, next_id) = parse_file(&main);
        let merged = resolve_imports(program, &main, next_id).unwrap();
        assert!(merged.imports.is_empty());
        assert_eq!(merged.stmts.len(), 2);
        // Imported definition comes first
        assert!(matches!(&merged.stmts[0], Stmt::Assign { .. }));
    }

    #[test]
    fn test_double_include_is_merged_once() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.flap", "shared = 1");
        write(dir.path(), "b.flap", "import \"a.flap\"\nfrom_b = shared");
        let main = write(
            dir.path(),
            "main.flap",
            "import \"a.flap\"\nimport \"b.flap\"\nz = shared",
        );
        let (program, next_id) = parse_file(&main);
        let merged = resolve_imports(program, &main, next_id).unwrap();
        // a.flap's single statement must appear exactly once
        let count = merged
            .stmts
            .iter()
            .filter(|s| matches!(s, Stmt::Assign { targets, .. }
                if matches!(&targets[0], crate::ast::AssignTarget::Name(i) if i.name == "shared")))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_missing_import_errors() {
        let dir = tempfile::tempdir().unwrap();
        let main = write(dir.path(), "main.flap", "import \"ghost.flap\"\nx = 1");
        let (program, next_id) = parse_file(&main);
        let err = resolve_imports(program, &main, next_id).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
    }

    #[test]
    fn test_extension_added_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "tools.flap", "t = 1");
        let main = write(dir.path(), "main.flap", "import \"tools\"\nu = t");
        let (program, next_id) = parse_file(&main);
        let merged = resolve_imports(program, &main, next_id).unwrap();
        assert_eq!(merged.stmts.len(), 2);
    }

    #[test]
    fn test_lambda_ids_stay_unique_across_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "lib.flap", "double = x => x * 2");
        let main = write(dir.path(), "main.flap", "import \"lib.flap\"\ntriple = x => x * 3");
        let (program, next_id) = parse_file(&main);
        let merged = resolve_imports(program, &main, next_id).unwrap();
        let mut ids = Vec::new();
        for stmt in &merged.stmts {
            if let Stmt::Assign { value: crate::ast::Expr::Lambda(l), .. } = stmt {
                ids.push(l.id);
            }
        }
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }
}
