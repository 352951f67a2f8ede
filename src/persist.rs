//! Text persistence for derived tables.
//!
//! One file per non-empty IDB predicate, named after the predicate, lines
//! of `iteration<TAB>col0<TAB>col1…`. Dictionary decompression falls back
//! to the numeric id for terms without an entry; a predicate whose file
//! cannot be written is reported and skipped, the rest are still stored.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::error;

use crate::edb::term_text;
use crate::engine::SemiNaiveEngine;
use crate::error::{EngineError, EngineResult};

/// Write every non-empty IDB predicate of the engine to `path`.
pub fn store_on_files(
    engine: &SemiNaiveEngine,
    path: &Path,
    decompress: bool,
    min_iteration: usize,
) -> EngineResult<()> {
    fs::create_dir_all(path)?;

    let program = engine.program();
    for pred in 0..program.n_predicates() {
        if !program.is_idb(pred) {
            continue;
        }
        let blocks = engine
            .store()
            .read(pred, min_iteration, usize::MAX);
        if blocks.is_empty() {
            continue;
        }
        let file_path = path.join(program.predicate_name(pred));
        if let Err(e) = write_predicate(engine, blocks, &file_path, decompress) {
            error!(
                predicate = program.predicate_name(pred),
                error = %e,
                "failed to persist predicate"
            );
        }
    }
    Ok(())
}

fn write_predicate(
    engine: &SemiNaiveEngine,
    blocks: crate::table::FactIterator,
    file_path: &Path,
    decompress: bool,
) -> EngineResult<()> {
    let file = fs::File::create(file_path)?;
    let mut out = BufWriter::new(file);
    for block in blocks {
        for row in block.table.rows() {
            let mut line = block.iteration.to_string();
            for term in row {
                line.push('\t');
                if decompress {
                    match term_text(engine.edb_layer(), term) {
                        Ok(text) => line.push_str(&text),
                        Err(EngineError::DictMiss(_)) => line.push_str(&term.to_string()),
                        Err(other) => return Err(other),
                    }
                } else {
                    line.push_str(&term.to_string());
                }
            }
            writeln!(out, "{line}")?;
        }
    }
    out.flush()?;
    Ok(())
}
