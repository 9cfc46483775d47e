//! Playlist view over the shared entity collection.

use std::fmt;

use serde_json::{json, Value};
use time::PrimitiveDateTime;

use crate::{
    error::{Error, Result},
    model::Entity,
    table::Table,
    track::Track,
};

/// A playlist in the context of one table.
///
/// If multiple tables have the same playlist loaded, each table yields
/// its own `Playlist` value. Views are read-through projections: they are
/// recreated from the shared entity collection on each access so updates
/// are always reflected, and must not be cached beyond a single logical
/// operation — the underlying entity may be merged or pruned at any time.
#[derive(Clone)]
pub struct Playlist {
    table: Table,
    data: Entity,
}

impl Playlist {
    pub(crate) fn new(table: Table, data: Entity) -> Self {
        Self { table, data }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.data.id()
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.data.str_field("name")
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.data.str_field("description")
    }

    #[must_use]
    pub fn is_loop(&self) -> bool {
        self.data.bool_field("is_loop").unwrap_or(false)
    }

    #[must_use]
    pub fn is_shuffle(&self) -> bool {
        self.data.bool_field("is_shuffle").unwrap_or(false)
    }

    #[must_use]
    pub fn version(&self) -> Option<i64> {
        self.data.i64_field("version")
    }

    /// When the playlist was created on the table.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the field is missing or malformed.
    pub fn created_time(&self) -> Result<PrimitiveDateTime> {
        parse_date(self.data.str_field("created_at"))
    }

    /// When the playlist was last modified on the table.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the field is missing or malformed.
    pub fn updated_time(&self) -> Result<PrimitiveDateTime> {
        parse_date(self.data.str_field("updated_at"))
    }

    /// The playlist's tracks in playback order (unshuffled).
    ///
    /// A track design occurring multiple times yields one view per
    /// occurrence, each with its own playlist index.
    #[must_use]
    pub fn tracks(&self) -> Vec<Track> {
        self.data
            .get("sorted_tracks")
            .and_then(Value::as_array)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(Value::as_u64)
                    .filter_map(|index| usize::try_from(index).ok())
                    .filter_map(|index| self.track_by_index(index))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn get_tracks_named(&self, name: &str) -> Vec<Track> {
        self.tracks()
            .into_iter()
            .filter(|track| track.name() == Some(name))
            .collect()
    }

    /// The track currently playing from this playlist, if any.
    #[must_use]
    pub fn active_track(&self) -> Option<Track> {
        let index = self.data.i64_field("active_track_index")?;
        let index = usize::try_from(index).ok()?;
        self.track_by_index(index)
    }

    fn track_by_index(&self, index: usize) -> Option<Track> {
        let raw = self.data.get("tracks")?.as_array()?.get(index)?.clone();
        let Value::Object(map) = raw else {
            return None;
        };
        let entity = Entity::from_map(map).ok()?;
        Some(Track::new(self.table.clone(), Some(self.clone()), entity))
    }

    /// Sets shuffle on this playlist.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` unless this is the table's active
    /// playlist. A no-op change issues no network call.
    pub async fn set_shuffle(&self, value: bool) -> Result<()> {
        let active = self.table.active_playlist();
        if active.is_none_or(|playlist| playlist.id() != self.id()) {
            return Err(Error::failed_precondition(
                "set_shuffle may only be called on the active playlist",
            ));
        }

        if value == self.is_shuffle() {
            return Ok(());
        }

        self.table
            .send("set_shuffle", json!({"value": value.to_string()}))
            .await
    }

    /// Starts playing this playlist, optionally from a specific track.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the given track does not belong to
    /// this playlist, or the transport error of the underlying commands.
    pub async fn play(&self, track: Option<&Track>) -> Result<()> {
        let mut payload = self.data.clone();
        if let Some(track) = track {
            if track.playlist_id() != Some(self.id()) {
                return Err(Error::invalid_argument(
                    "track is not part of this playlist",
                ));
            }
            let index = track.index_in_playlist().ok_or_else(|| {
                Error::invalid_argument("track carries no playlist index")
            })?;

            payload.set("active_track_index", json!(index));
            payload.set("active_track_id", json!(track.id()));
        }

        self.table
            .send("set_playlist", Value::Object(payload.fields().clone()))
            .await?;
        self.table.play().await
    }
}

impl fmt::Display for Playlist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{} ({} tracks)",
            self.name().unwrap_or(self.id()),
            self.version().unwrap_or(0),
            self.tracks().len()
        )
    }
}

fn parse_date(value: Option<&str>) -> Result<PrimitiveDateTime> {
    let value = value.ok_or_else(|| Error::invalid_argument("timestamp field missing"))?;
    let format = time::macros::format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    );
    PrimitiveDateTime::parse(value, &format).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_table_timestamps() {
        let parsed = parse_date(Some("2018-02-10 14:14:44")).expect("valid timestamp");
        assert_eq!(parsed.to_string(), "2018-02-10 14:14:44.0");

        assert!(parse_date(Some("not a date")).is_err());
        assert!(parse_date(None).is_err());
    }
}
