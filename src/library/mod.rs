mod episode;
mod media;
mod store;

pub use episode::{EpisodeId, EpisodeRecord};
pub use media::{
    MediaKind, generate_file_name, media_extension, media_kind, mime_from_path,
    unique_file_name,
};
pub use store::{EpisodeLibrary, FileLibrary};
