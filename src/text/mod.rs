//! # Text Frontend
//!
//! A small Datalog reader for the binary and the examples. Clauses look
//! like `tc(X, Z) :- tc(X, Y), edge(Y, Z).`; identifiers starting with an
//! uppercase letter are variables, everything else is a constant and goes
//! through the dictionary. A clause without a body and without variables
//! is a ground fact and lands in the EDB. The engine itself never sees any
//! of this; it only consumes the resulting program and term ids.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

use crate::edb::InMemoryEdb;
use crate::model::{Literal, PredKind, Program, Rule, TermOrVar, Var};

/// Errors of the text frontend.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("{0}")]
    Semantic(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed program together with the facts it declared inline.
pub struct ParsedProgram {
    pub program: Program,
    pub edb: InMemoryEdb,
}

#[derive(Debug)]
struct RawAtom {
    name: String,
    args: Vec<String>,
}

#[derive(Debug)]
struct RawClause {
    head: RawAtom,
    body: Vec<RawAtom>,
}

fn strip_comment(line: &str) -> &str {
    let cut = line
        .find('%')
        .into_iter()
        .chain(line.find("//"))
        .min()
        .unwrap_or(line.len());
    &line[..cut]
}

fn is_variable(token: &str) -> bool {
    token
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_uppercase() || c == '_')
}

fn split_top_level(text: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c == separator && depth == 0 => {
                parts.push(current.trim().to_string());
                current = String::new();
            }
            c => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn parse_atom(text: &str) -> Result<RawAtom, ParseError> {
    let text = text.trim();
    let open = text
        .find('(')
        .ok_or_else(|| ParseError::Syntax(format!("expected '(' in atom '{text}'")))?;
    if !text.ends_with(')') {
        return Err(ParseError::Syntax(format!("expected ')' in atom '{text}'")));
    }
    let name = text[..open].trim();
    if name.is_empty() {
        return Err(ParseError::Syntax(format!("missing predicate name in '{text}'")));
    }
    let args: Vec<String> = split_top_level(&text[open + 1..text.len() - 1], ',')
        .into_iter()
        .map(|a| a.trim_matches('"').to_string())
        .collect();
    if args.iter().any(String::is_empty) {
        return Err(ParseError::Syntax(format!("empty argument in atom '{text}'")));
    }
    Ok(RawAtom {
        name: name.to_string(),
        args,
    })
}

fn parse_clause(text: &str) -> Result<RawClause, ParseError> {
    match text.split_once(":-") {
        Some((head, body)) => Ok(RawClause {
            head: parse_atom(head)?,
            body: split_top_level(body, ',')
                .iter()
                .map(|a| parse_atom(a))
                .collect::<Result<_, _>>()?,
        }),
        None => Ok(RawClause {
            head: parse_atom(text)?,
            body: Vec::new(),
        }),
    }
}

fn build_literal(
    atom: &RawAtom,
    program: &Program,
    edb: &mut InMemoryEdb,
    vars: &mut HashMap<String, Var>,
) -> Result<Literal, ParseError> {
    let predicate = program
        .predicate_by_name(&atom.name)
        .ok_or_else(|| ParseError::Semantic(format!("unknown predicate '{}'", atom.name)))?;
    let tuple = atom
        .args
        .iter()
        .map(|arg| {
            if is_variable(arg) {
                let next = vars.len();
                if next > usize::from(Var::MAX) && !vars.contains_key(arg) {
                    return Err(ParseError::Semantic(format!(
                        "too many variables in one rule (at '{arg}')"
                    )));
                }
                Ok(TermOrVar::Var(*vars.entry(arg.clone()).or_insert(next as Var)))
            } else {
                Ok(TermOrVar::Const(edb.encode(arg)))
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Literal::new(predicate, tuple))
}

/// Parse a Datalog source text into a program plus its inline facts.
pub fn parse_program(source: &str) -> Result<ParsedProgram, ParseError> {
    let cleaned: String = source.lines().map(strip_comment).collect::<Vec<_>>().join("\n");
    let clauses: Vec<RawClause> = split_top_level(&cleaned, '.')
        .iter()
        .filter(|c| !c.trim().is_empty())
        .map(|c| parse_clause(c))
        .collect::<Result<_, _>>()?;

    // Names defined by a rule are intensional; everything else extensional.
    let mut program = Program::new();
    let mut edb = InMemoryEdb::new();
    let rule_heads: Vec<&str> = clauses
        .iter()
        .filter(|c| !c.body.is_empty())
        .map(|c| c.head.name.as_str())
        .collect();

    for clause in &clauses {
        let head_kind = if rule_heads.contains(&clause.head.name.as_str()) {
            PredKind::Idb
        } else {
            PredKind::Edb
        };
        program
            .register_predicate(&clause.head.name, clause.head.args.len(), head_kind)
            .map_err(ParseError::Semantic)?;
        for atom in &clause.body {
            let kind = if rule_heads.contains(&atom.name.as_str()) {
                PredKind::Idb
            } else {
                PredKind::Edb
            };
            program
                .register_predicate(&atom.name, atom.args.len(), kind)
                .map_err(ParseError::Semantic)?;
        }
    }

    for clause in &clauses {
        if clause.body.is_empty() {
            if clause.head.args.iter().any(|a| is_variable(a)) {
                return Err(ParseError::Semantic(format!(
                    "fact '{}' must be ground",
                    clause.head.name
                )));
            }
            let pred = program
                .predicate_by_name(&clause.head.name)
                .ok_or_else(|| ParseError::Semantic(format!("unknown predicate '{}'", clause.head.name)))?;
            let row = clause.head.args.iter().map(|a| edb.encode(a)).collect();
            edb.add_fact(pred.id, row);
        } else {
            let mut vars = HashMap::new();
            let head = build_literal(&clause.head, &program, &mut edb, &mut vars)?;
            let body = clause
                .body
                .iter()
                .map(|a| build_literal(a, &program, &mut edb, &mut vars))
                .collect::<Result<Vec<_>, _>>()?;
            program
                .add_rule(Rule::new(head, body))
                .map_err(ParseError::Semantic)?;
        }
    }

    Ok(ParsedProgram { program, edb })
}

/// Parse a single goal atom like `tc(1, Y)` against an existing program.
pub fn parse_goal(text: &str, parsed: &mut ParsedProgram) -> Result<Literal, ParseError> {
    let atom = parse_atom(text.trim().trim_end_matches('.'))?;
    let mut vars = HashMap::new();
    build_literal(&atom, &parsed.program, &mut parsed.edb, &mut vars)
}

/// Load tab-separated fact files from a directory: one file per relation,
/// named after it (an optional `.tsv` extension is dropped), one fact per
/// line.
pub fn load_facts_dir(dir: &Path, parsed: &mut ParsedProgram) -> Result<(), ParseError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ParseError::Semantic(format!("unreadable file name: {path:?}")))?
            .to_string();
        let content = std::fs::read_to_string(&path)?;
        let mut rows = Vec::new();
        let mut arity = None;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let row: Vec<_> = line.split('\t').map(|t| parsed.edb.encode(t)).collect();
            match arity {
                None => arity = Some(row.len()),
                Some(a) if a != row.len() => {
                    return Err(ParseError::Semantic(format!(
                        "inconsistent arity in fact file '{name}'"
                    )))
                }
                Some(_) => {}
            }
            rows.push(row);
        }
        let Some(arity) = arity else { continue };
        let pred = parsed
            .program
            .register_predicate(&name, arity, PredKind::Edb)
            .map_err(ParseError::Semantic)?;
        parsed.edb.add_facts(pred, rows);
    }
    Ok(())
}
