pub mod ingest;
pub mod merge;
