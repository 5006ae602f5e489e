// Library management module
// Turns raw files into songs made of stems, and keeps playlist order

pub mod grouping;
pub mod models;
pub mod playlist;
pub mod scanner;

pub use grouping::{group, DEFAULT_STEM_LABEL, SUPPORTED_EXTENSIONS};
pub use models::{FileContent, Library, RawFile, Song, Stem};
pub use scanner::scan_directory;
