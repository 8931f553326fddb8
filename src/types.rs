/// Name of a column used to define strata.
/// Examples: `state`, `purpose`, `orig_date`
pub type FieldName = String;
/// Name of a table (or relation) held by a data source or stratum store.
/// Examples: `loans`, `tmp.strata`, `tmp.sample`
pub type TableName = String;
/// Identifier for the data source that served a request.
/// Examples: `memory`, `loans_jsonl`
pub type SourceId = String;
/// Rendered report text.
/// Example: `state    Count\nCA       1,204\n    1,204 total obs`
pub type ReportText = String;
