//! Operator-facing results: per-table outcomes, fix-row tallies, and the
//! final verdict. The report is cloned into every checkpoint save so a resumed
//! run continues from the same tallies it crashed with.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkId;
use crate::source::TableDiff;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableReport {
    pub schema: String,
    pub table: String,
    pub struct_equal: bool,
    pub struct_skip: bool,
    pub data_equal: bool,
    pub rows_add: usize,
    pub rows_delete: usize,
    pub chunk_count: usize,
    pub failed_chunk_count: usize,
    pub errors: Vec<String>,
}

impl TableReport {
    fn new(schema: &str, table: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
            struct_equal: true,
            struct_skip: false,
            data_equal: true,
            rows_add: 0,
            rows_delete: 0,
            chunk_count: 0,
            failed_chunk_count: 0,
            errors: Vec::new(),
        }
    }

    fn pass(&self) -> bool {
        self.struct_equal && !self.struct_skip && self.data_equal && self.errors.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Report {
    tables: BTreeMap<String, TableReport>,
}

impl Report {
    pub fn init(&mut self, tables: &[Arc<TableDiff>]) {
        for table in tables {
            self.tables
                .entry(table.full_name())
                .or_insert_with(|| TableReport::new(&table.schema, &table.table));
        }
    }

    /// Restores the tallies saved with a checkpoint.
    pub fn load(&mut self, snapshot: Report) {
        for (name, table) in snapshot.tables {
            self.tables.insert(name, table);
        }
    }

    pub fn set_table_struct_check_result(
        &mut self,
        schema: &str,
        table: &str,
        is_equal: bool,
        is_skip: bool,
    ) {
        let entry = self.entry(schema, table);
        entry.struct_equal = is_equal;
        entry.struct_skip = is_skip;
    }

    pub fn set_table_data_check_result(
        &mut self,
        schema: &str,
        table: &str,
        is_equal: bool,
        rows_add: usize,
        rows_delete: usize,
        chunk_id: ChunkId,
    ) {
        let entry = self.entry(schema, table);
        entry.chunk_count += 1;
        entry.rows_add += rows_add;
        entry.rows_delete += rows_delete;
        if !is_equal {
            entry.data_equal = false;
            entry.failed_chunk_count += 1;
            tracing::debug!(
                schema,
                table,
                chunk = ?chunk_id,
                "chunk data check failed"
            );
        }
    }

    pub fn set_table_meet_error(&mut self, schema: &str, table: &str, err: &anyhow::Error) {
        self.entry(schema, table).errors.push(format!("{err:#}"));
    }

    pub fn snapshot(&self) -> Report {
        self.clone()
    }

    pub fn pass(&self) -> bool {
        self.tables.values().all(TableReport::pass)
    }

    pub fn print(&self, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(out, "summary:")?;
        for report in self.tables.values() {
            let structure = if report.struct_skip {
                "skipped"
            } else if report.struct_equal {
                "equal"
            } else {
                "not equal"
            };
            let data = if report.struct_skip {
                "skipped".to_string()
            } else if report.data_equal {
                format!("equal ({} chunks)", report.chunk_count)
            } else {
                format!(
                    "not equal ({}/{} chunks failed, +{} rows, -{} rows)",
                    report.failed_chunk_count,
                    report.chunk_count,
                    report.rows_add,
                    report.rows_delete
                )
            };
            writeln!(
                out,
                "  {}.{}: structure {}, data {}",
                report.schema, report.table, structure, data
            )?;
            for err in &report.errors {
                writeln!(out, "    error: {err}")?;
            }
        }
        if self.pass() {
            writeln!(out, "check passed: upstream and downstream are identical")?;
        } else {
            writeln!(out, "check failed: the tables above diverge")?;
        }
        Ok(())
    }

    fn entry(&mut self, schema: &str, table: &str) -> &mut TableReport {
        self.tables
            .entry(format!("{schema}.{table}"))
            .or_insert_with(|| TableReport::new(schema, table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_chunk_fails_the_verdict() {
        let mut report = Report::default();
        report.set_table_data_check_result("s", "t", true, 0, 0, ChunkId::new(0, 0, 2));
        assert!(report.pass());
        report.set_table_data_check_result("s", "t", false, 2, 1, ChunkId::new(0, 1, 2));
        assert!(!report.pass());

        let entry = &report.tables["s.t"];
        assert_eq!(entry.chunk_count, 2);
        assert_eq!(entry.failed_chunk_count, 1);
        assert_eq!(entry.rows_add, 2);
        assert_eq!(entry.rows_delete, 1);
    }

    #[test]
    fn snapshot_round_trips_through_load() {
        let mut report = Report::default();
        report.set_table_struct_check_result("s", "t", false, false);
        let snap = report.snapshot();

        let mut restored = Report::default();
        restored.load(snap);
        assert!(!restored.pass());
        assert!(!restored.tables["s.t"].struct_equal);
    }

    #[test]
    fn skipped_struct_check_fails_the_verdict() {
        let mut report = Report::default();
        report.set_table_struct_check_result("s", "t", false, true);
        assert!(!report.pass());
    }
}
