pub mod file;
pub mod index;
pub mod media;

pub use file::{FileService, StagedUpload};
pub use index::FileIndex;
