//! Job identifier guessing and decomposition.
//!
//! Identifiers conventionally look like `ZAO001`: an alphabetic project tag
//! followed by a numeric run index. Decomposition is best-effort; a token that
//! does not follow the convention is kept verbatim with no project or run.

use std::io::{BufRead, Write};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{JobDbError, Result};
use crate::properties::PropertySet;

static DECOMPOSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<project>[A-Za-z]*).*?(?P<run>[0-9]*)$").expect("Invalid identifier regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    pub id: String,
    pub project: Option<String>,
    pub run: Option<String>,
}

impl Identifier {
    /// The identifier under `key` (the schema's key column) plus `project` /
    /// `run`, absent fields included.
    pub fn to_properties(&self, key: &str) -> PropertySet {
        let mut props = PropertySet::new();
        props.push(key, Some(self.id.clone()));
        props.push("project", self.project.clone());
        props.push("run", self.run.clone());
        props
    }
}

/// Supplies an identifier when nothing usable was given or guessed.
pub trait IdentifierPrompt {
    /// Ask for an identifier; `context` names what the identifier is for.
    fn prompt_identifier(&mut self, context: &str) -> Result<Option<String>>;
}

/// Line-oriented prompt over arbitrary reader/writer pairs (stdin/stderr in the CLI).
pub struct LinePrompt<R, W> {
    reader: R,
    writer: W,
}

impl<R: BufRead, W: Write> LinePrompt<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R: BufRead, W: Write> IdentifierPrompt for LinePrompt<R, W> {
    fn prompt_identifier(&mut self, context: &str) -> Result<Option<String>> {
        write!(self.writer, "job identifier for {context}: ")?;
        self.writer.flush()?;
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let line = line.trim();
        Ok((!line.is_empty()).then(|| line.to_string()))
    }
}

/// Decompose a hint into an identifier. Pure; never fails.
///
/// The leading run of letters is the project and the trailing run of digits
/// is the run index. A token without a trailing digit run has no run index
/// and is treated as untagged, so neither field is derived from it.
pub fn resolve(hint: &str) -> Identifier {
    let id = hint.trim().to_string();
    let (project, run) = match DECOMPOSE.captures(&id) {
        Some(caps) => {
            let project = caps.name("project").map_or("", |m| m.as_str());
            let run = caps.name("run").map_or("", |m| m.as_str());
            if run.is_empty() {
                (None, None)
            } else {
                let project = (!project.is_empty()).then(|| project.to_string());
                (project, Some(run.to_string()))
            }
        }
        None => (None, None),
    };
    Identifier { id, project, run }
}

/// Filename stem used as an identifier hint: everything before the first dot.
pub fn hint_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let stem = name.split('.').next().unwrap_or(name).trim();
    (!stem.is_empty()).then(|| stem.to_string())
}

pub fn guess_from_path(path: &Path) -> Option<Identifier> {
    hint_from_path(path).map(|hint| resolve(&hint))
}

/// Resolve `hint`, asking `prompt` when it is missing or blank.
///
/// An empty answer is an error; an identifier is never invented.
pub fn resolve_or_prompt(
    hint: Option<&str>,
    context: &str,
    prompt: &mut dyn IdentifierPrompt,
) -> Result<Identifier> {
    if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
        return Ok(resolve(hint));
    }
    match prompt.prompt_identifier(context)? {
        Some(answer) if !answer.trim().is_empty() => Ok(resolve(&answer)),
        _ => Err(JobDbError::MalformedInput(format!(
            "no job identifier supplied for {context}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Scripted(Option<String>, usize);

    impl IdentifierPrompt for Scripted {
        fn prompt_identifier(&mut self, _context: &str) -> Result<Option<String>> {
            self.1 += 1;
            Ok(self.0.clone())
        }
    }

    #[test]
    fn resolves_project_and_run() {
        let ident = resolve("ZAO001");
        assert_eq!(ident.id, "ZAO001");
        assert_eq!(ident.project.as_deref(), Some("ZAO"));
        assert_eq!(ident.run.as_deref(), Some("001"));
    }

    #[test]
    fn untagged_token_keeps_only_the_id() {
        let ident = resolve("untagged");
        assert_eq!(
            ident,
            Identifier {
                id: "untagged".to_string(),
                project: None,
                run: None,
            }
        );
    }

    #[test]
    fn partial_matches_leave_fields_absent() {
        let ident = resolve("0042");
        assert_eq!(ident.project, None);
        assert_eq!(ident.run.as_deref(), Some("0042"));

        let ident = resolve("ZAO001_relax");
        assert_eq!(ident.project, None);
        assert_eq!(ident.run, None);

        let ident = resolve("ZAO_v12");
        assert_eq!(ident.project.as_deref(), Some("ZAO"));
        assert_eq!(ident.run.as_deref(), Some("12"));
    }

    #[test]
    fn hint_is_the_filename_stem() {
        let path = Path::new("jobs/active/ZAO017.opt.org");
        assert_eq!(hint_from_path(path).as_deref(), Some("ZAO017"));
        let ident = guess_from_path(path).unwrap();
        assert_eq!(ident.run.as_deref(), Some("017"));
        assert_eq!(hint_from_path(Path::new(".hidden")), None);
    }

    #[test]
    fn explicit_hint_skips_the_prompt() {
        let mut prompt = Scripted(Some("never".into()), 0);
        let ident = resolve_or_prompt(Some(" AB12 "), "stdin", &mut prompt).unwrap();
        assert_eq!(ident.id, "AB12");
        assert_eq!(prompt.1, 0);
    }

    #[test]
    fn missing_hint_asks_the_prompt() {
        let mut prompt = Scripted(Some("CD7".into()), 0);
        let ident = resolve_or_prompt(Some("  "), "stdin", &mut prompt).unwrap();
        assert_eq!(ident.project.as_deref(), Some("CD"));
        assert_eq!(prompt.1, 1);
    }

    #[test]
    fn empty_answer_is_an_error() {
        let mut prompt = Scripted(None, 0);
        let err = resolve_or_prompt(None, "stdin", &mut prompt).unwrap_err();
        assert!(matches!(err, JobDbError::MalformedInput(_)));
    }

    #[test]
    fn line_prompt_reads_one_line() {
        let mut out = Vec::new();
        let mut prompt = LinePrompt::new(Cursor::new("XY9\nignored\n"), &mut out);
        let answer = prompt.prompt_identifier("job.org").unwrap();
        assert_eq!(answer.as_deref(), Some("XY9"));
        assert!(String::from_utf8(out).unwrap().contains("job.org"));
    }

    #[test]
    fn identifier_properties_carry_absent_fields() {
        let props = resolve("untagged").to_properties("id");
        assert_eq!(props.get("ID"), Some(Some("untagged")));
        assert_eq!(props.get("project"), Some(None));
    }

    #[test]
    fn identifier_lands_in_the_named_key_column() {
        let schema = crate::schema::Schema::define([
            crate::schema::ColumnDef::text("job"),
            crate::schema::ColumnDef::text("run"),
        ])
        .unwrap();
        let props = resolve("ZAO001").to_properties(schema.key_name());
        assert_eq!(props.get("job"), Some(Some("ZAO001")));
        assert!(!props.contains_key("id"));

        let row = crate::normalize::normalize(&props, &schema);
        assert_eq!(row.get("job"), Some(&crate::row::Value::from("ZAO001")));
        assert_eq!(row.get("run"), Some(&crate::row::Value::from("001")));
    }
}
