pub mod bootstrap;
pub mod config;
pub mod errors;
pub mod extractor;
pub mod ingestor;
pub mod notification;
pub mod policy;
pub mod record;
pub mod sink;
pub mod source;
pub mod storage;
pub mod telemetry;
