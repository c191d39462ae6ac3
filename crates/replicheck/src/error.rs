use thiserror::Error;

/// Invariant violations that must stop the whole check rather than degrade a
/// single chunk or table. These are surfaced at the top-level handler; every
/// other error stays chunk- or table-scoped.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("bisected chunk counts do not add up: {left} + {right} != {parent}")]
    SplitCountMismatch { left: i64, right: i64, parent: i64 },

    #[error("both halves of an unequal chunk verified equal")]
    SplitBothHalvesEqual,

    #[error("fix sql file already exists: {path}")]
    FixFileCollision { path: String },

    #[error("table {schema}.{table} has no primary key")]
    MissingPrimaryKey { schema: String, table: String },

    #[error("composite primary key on {schema}.{table} is not supported for continuous validation")]
    CompositePrimaryKey { schema: String, table: String },

    #[error("incomplete row event for {schema}.{table}: replica stream skipped columns")]
    IncompleteRowEvent { schema: String, table: String },
}
