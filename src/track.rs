//! Track view over the shared entity collection.

use std::fmt;

use serde_json::Value;

use crate::{error::Result, model::Entity, playlist::Playlist, table::Table};

/// Port of the table's media server, which serves track thumbnails.
const MEDIA_PORT: u16 = 3001;

/// Pre-rendered thumbnail sizes the table's media server offers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ThumbnailSize {
    Small,
    Medium,
    Large,
}

impl ThumbnailSize {
    /// Edge length in pixels.
    #[must_use]
    pub fn pixels(self) -> u32 {
        match self {
            Self::Small => 50,
            Self::Medium => 100,
            Self::Large => 400,
        }
    }
}

/// A track design, either standalone or as one occurrence in a playlist.
///
/// The same design can occur multiple times in a playlist; each
/// occurrence is its own view with its own playlist index. Like all
/// views, a `Track` is a read-through projection and must not be cached
/// across state updates.
#[derive(Clone)]
pub struct Track {
    table: Table,
    playlist: Option<Playlist>,
    data: Entity,
}

impl Track {
    pub(crate) fn new(table: Table, playlist: Option<Playlist>, data: Entity) -> Self {
        Self {
            table,
            playlist,
            data,
        }
    }

    /// The ID of the track design, shared by all its occurrences.
    #[must_use]
    pub fn id(&self) -> &str {
        self.data.id()
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.data.str_field("name")
    }

    /// Whether this view is an occurrence within a playlist.
    #[must_use]
    pub fn is_in_playlist(&self) -> bool {
        self.data.get("_index").is_some()
    }

    /// Position of this occurrence in its playlist.
    #[must_use]
    pub fn index_in_playlist(&self) -> Option<i64> {
        self.data.i64_field("_index")
    }

    pub(crate) fn playlist_id(&self) -> Option<&str> {
        self.playlist.as_ref().map(Playlist::id)
    }

    /// URL of a pre-rendered thumbnail of the track's path.
    #[must_use]
    pub fn thumbnail_url(&self, size: ThumbnailSize) -> String {
        format!(
            "http://{}:{MEDIA_PORT}/thumbnail/{}/{}",
            self.table.host(),
            size.pixels(),
            self.id()
        )
    }

    /// Starts playing this track.
    ///
    /// An occurrence plays through its playlist, which stays active; a
    /// standalone track replaces the active playlist.
    ///
    /// # Errors
    ///
    /// Propagates command channel failures.
    pub async fn play(&self) -> Result<()> {
        match &self.playlist {
            Some(playlist) => playlist.play(Some(self)).await,
            None => {
                self.table
                    .send("set_track", Value::Object(self.data.fields().clone()))
                    .await?;
                self.table.play().await
            }
        }
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name().unwrap_or(self.id()))
    }
}
