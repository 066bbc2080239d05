pub mod chunker;
pub mod crawler;
pub mod extractor;
pub mod files;
