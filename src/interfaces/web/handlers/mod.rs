pub mod chat;
pub mod ingest;
pub mod schedules;
