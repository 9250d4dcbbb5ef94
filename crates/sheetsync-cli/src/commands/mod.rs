pub mod common;
pub mod completions;
pub mod conflicts;
pub mod documents;
pub mod edit;
pub mod failed;
pub mod ingest;
pub mod run;
pub mod status;
