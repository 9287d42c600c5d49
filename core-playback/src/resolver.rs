//! # Item Resolver
//!
//! Expands the roots of a play request (folders, playlists, artists,
//! genres, series, single episodes, photos) into the flat list of items the
//! queue is built from.
//!
//! ## Expansion rules
//!
//! | Root                 | Expands to                                          |
//! |----------------------|-----------------------------------------------------|
//! | Program              | its channel                                         |
//! | Playlist             | its children                                        |
//! | MusicArtist          | the artist's tracks, album order                    |
//! | MusicGenre / Genre   | tracks / videos of the genre                        |
//! | Studio               | videos of the studio                                |
//! | PhotoAlbum           | its photos                                          |
//! | Series / Season      | episodes, starting at the first unplayed one        |
//! | Episode (alone)      | the series from that episode on                     |
//! | Photo                | its siblings, starting at the photo                 |
//! | other folders        | their audio and video children                      |
//!
//! Multi-part movies and episodes gain their additional parts afterwards.

use crate::error::{PlaybackError, Result};
use bridge_traits::{
    CatalogClient, EpisodeQuery, ItemKind, ItemPlayOptions, ItemQuery, MediaType, PlayableItem,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Episodes loaded when a whole series is played.
const SERIES_EPISODE_LIMIT: u32 = 100;

const ALBUM_ORDER: [&str; 4] = ["Album", "ParentIndexNumber", "IndexNumber", "SortName"];

/// Request accepted by `PlaybackManager::play` and the queue operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayOptions {
    /// Catalog ids to play. Ignored when `items` is not empty.
    pub ids: Vec<String>,
    pub items: Vec<PlayableItem>,
    pub start_index: Option<usize>,
    pub start_position_ticks: Option<i64>,
    pub media_source_id: Option<String>,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub fullscreen: bool,
    pub shuffle: bool,
}

impl Default for PlayOptions {
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            items: Vec::new(),
            start_index: None,
            start_position_ticks: None,
            media_source_id: None,
            audio_stream_index: None,
            subtitle_stream_index: None,
            fullscreen: true,
            shuffle: false,
        }
    }
}

impl PlayOptions {
    pub fn ids(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn items(items: Vec<PlayableItem>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    pub fn with_start_index(mut self, index: usize) -> Self {
        self.start_index = Some(index);
        self
    }

    pub fn with_start_position(mut self, ticks: i64) -> Self {
        self.start_position_ticks = Some(ticks);
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_fullscreen(mut self, fullscreen: bool) -> Self {
        self.fullscreen = fullscreen;
        self
    }

    /// Per-item options attached to the first queue entry.
    pub fn item_options(&self) -> ItemPlayOptions {
        ItemPlayOptions {
            fullscreen: self.fullscreen,
            start_position_ticks: self.start_position_ticks,
            media_source_id: self.media_source_id.clone(),
            audio_stream_index: self.audio_stream_index,
            subtitle_stream_index: self.subtitle_stream_index,
        }
    }
}

/// Flat item list plus the index playback starts at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedItems {
    pub items: Vec<PlayableItem>,
    pub start_index: Option<usize>,
}

impl ResolvedItems {
    fn unchanged(items: Vec<PlayableItem>, start_index: Option<usize>) -> Self {
        Self { items, start_index }
    }
}

pub struct ItemResolver {
    catalog: Arc<dyn CatalogClient>,
    item_limit: u32,
    next_episode_auto_play: bool,
    cinema_mode: bool,
}

impl ItemResolver {
    pub fn new(
        catalog: Arc<dyn CatalogClient>,
        item_limit: u32,
        next_episode_auto_play: bool,
        cinema_mode: bool,
    ) -> Self {
        Self {
            catalog,
            item_limit,
            next_episode_auto_play,
            cinema_mode,
        }
    }

    /// Everything `play` needs before the first item is negotiated: the
    /// roots, their expansion and any additional parts.
    ///
    /// `supports_progress` tells whether the renderer for a lone episode
    /// reports positions; only then is the rest of the series queued.
    #[instrument(skip(self, options), fields(ids = options.ids.len(), items = options.items.len()))]
    pub async fn resolve(
        &self,
        options: &PlayOptions,
        supports_progress: bool,
    ) -> Result<ResolvedItems> {
        let roots = if options.items.is_empty() {
            self.items_for_playback(&options.ids).await?
        } else {
            options.items.clone()
        };

        let translated = self
            .translate_items(roots, options, supports_progress)
            .await?;
        let resolved = self.with_additional_parts(translated).await;

        debug!(
            count = resolved.items.len(),
            start_index = ?resolved.start_index,
            "Resolved items for playback"
        );
        Ok(resolved)
    }

    /// Fetch catalog items by id, in the order the ids were given.
    pub async fn items_for_playback(&self, ids: &[String]) -> Result<Vec<PlayableItem>> {
        match ids {
            [] => Err(PlaybackError::InvalidRequest(
                "play request carries neither ids nor items".to_string(),
            )),
            [id] => Ok(vec![self.catalog.get_item(id).await?]),
            _ => {
                let mut items = self
                    .catalog
                    .resolve_items(ItemQuery {
                        ids: ids.to_vec(),
                        limit: Some(self.item_limit),
                        ..ItemQuery::default()
                    })
                    .await?;
                items.sort_by_key(|item| {
                    item.id
                        .as_ref()
                        .and_then(|id| ids.iter().position(|i| i == id))
                        .unwrap_or(usize::MAX)
                });
                Ok(items)
            }
        }
    }

    /// Expand the first root according to its kind.
    pub async fn translate_items(
        &self,
        items: Vec<PlayableItem>,
        options: &PlayOptions,
        supports_progress: bool,
    ) -> Result<ResolvedItems> {
        let Some(first) = items.first().cloned() else {
            return Ok(ResolvedItems::default());
        };
        let shuffle = options.shuffle;
        let Some(first_id) = first.id.clone() else {
            return Ok(ResolvedItems::unchanged(items, options.start_index));
        };

        let query = match first.kind {
            ItemKind::Program => {
                return match first.channel_id.as_ref() {
                    Some(channel_id) => Ok(ResolvedItems::unchanged(
                        vec![self.catalog.get_item(channel_id).await?],
                        options.start_index,
                    )),
                    None => Ok(ResolvedItems::unchanged(items, options.start_index)),
                };
            }
            ItemKind::Playlist => ItemQuery {
                parent_id: Some(first_id),
                random: shuffle,
                limit: Some(self.item_limit),
                ..ItemQuery::default()
            },
            ItemKind::MusicArtist => ItemQuery {
                artist_ids: vec![first_id],
                media_types: vec![MediaType::Audio],
                sort_by: sort_fields(&ALBUM_ORDER),
                ..self.child_query(shuffle)
            },
            ItemKind::PhotoAlbum => ItemQuery {
                parent_id: Some(first_id),
                recursive: false,
                media_types: vec![MediaType::Photo],
                limit: None,
                ..self.child_query(shuffle)
            },
            ItemKind::MusicGenre => ItemQuery {
                genre_ids: vec![first_id],
                media_types: vec![MediaType::Audio],
                ..self.child_query(shuffle)
            },
            ItemKind::Genre => ItemQuery {
                genre_ids: vec![first_id],
                parent_id: first.parent_id.clone(),
                media_types: vec![MediaType::Video],
                ..self.child_query(shuffle)
            },
            ItemKind::Studio => ItemQuery {
                studio_ids: vec![first_id],
                media_types: vec![MediaType::Video],
                ..self.child_query(shuffle)
            },
            ItemKind::Series | ItemKind::Season => {
                return self.series_items(&first, &items, options).await;
            }
            ItemKind::Episode => {
                if items.len() == 1 && supports_progress && self.next_episode_auto_play {
                    if let Some(resolved) = self.episodes_from(&first).await? {
                        return Ok(resolved);
                    }
                }
                return Ok(ResolvedItems::unchanged(items, options.start_index));
            }
            _ => match self.folder_query(&first, shuffle) {
                Some(query) => query,
                None => return Ok(ResolvedItems::unchanged(items, options.start_index)),
            },
        };

        let children = self.catalog.resolve_items(query).await?;

        if first.media_type == MediaType::Photo {
            let start_index = children
                .iter()
                .position(|c| c.id.is_some() && c.id == first.id)
                .unwrap_or(0);
            return Ok(ResolvedItems::unchanged(children, Some(start_index)));
        }

        Ok(ResolvedItems::unchanged(children, options.start_index))
    }

    /// Recursive, leaf-only child query sorted by name or at random.
    fn child_query(&self, shuffle: bool) -> ItemQuery {
        ItemQuery {
            recursive: true,
            exclude_folders: true,
            sort_by: sort_fields(&["SortName"]),
            random: shuffle,
            limit: Some(self.item_limit),
            ..ItemQuery::default()
        }
    }

    /// Query for roots without a dedicated rule: single photos and folders.
    fn folder_query(&self, first: &PlayableItem, shuffle: bool) -> Option<ItemQuery> {
        if first.media_type == MediaType::Photo {
            return Some(ItemQuery {
                parent_id: first.parent_id.clone(),
                recursive: false,
                media_types: vec![MediaType::Photo, MediaType::Video],
                limit: None,
                ..self.child_query(shuffle)
            });
        }

        if !first.is_folder {
            return None;
        }

        if first.collection_type.as_deref() == Some("homevideos") {
            return Some(ItemQuery {
                parent_id: first.id.clone(),
                media_types: vec![MediaType::Photo],
                limit: None,
                ..self.child_query(shuffle)
            });
        }

        let sort_by = if first.kind == ItemKind::BoxSet {
            Vec::new()
        } else if first.collection_type.as_deref() == Some("music")
            || first.media_type == MediaType::Audio
        {
            sort_fields(&ALBUM_ORDER)
        } else {
            sort_fields(&["SortName"])
        };

        Some(ItemQuery {
            parent_id: first.id.clone(),
            media_types: vec![MediaType::Audio, MediaType::Video],
            sort_by,
            ..self.child_query(shuffle)
        })
    }

    async fn series_items(
        &self,
        first: &PlayableItem,
        items: &[PlayableItem],
        options: &PlayOptions,
    ) -> Result<ResolvedItems> {
        let start_season_id = if first.kind == ItemKind::Season {
            items
                .get(options.start_index.unwrap_or(0))
                .and_then(|season| season.id.clone())
        } else {
            None
        };
        let season_id = start_season_id.clone().filter(|_| items.len() == 1);
        let series_id = first
            .series_id
            .clone()
            .or_else(|| first.id.clone())
            .ok_or_else(|| PlaybackError::InvalidRequest("series without id".to_string()))?;

        // Playing in order from the top starts at the next unwatched episode.
        let mut start_item_id = None;
        if !options.shuffle && season_id.is_none() {
            let unplayed = self
                .catalog
                .resolve_items(ItemQuery {
                    parent_id: Some(series_id.clone()),
                    include_item_kinds: vec![ItemKind::Episode],
                    recursive: true,
                    unplayed_only: true,
                    sort_by: sort_fields(&["SeriesSortName", "SortName"]),
                    limit: Some(1),
                    ..ItemQuery::default()
                })
                .await?;
            start_item_id = unplayed.into_iter().next().and_then(|e| e.id);
        }

        let episodes = self
            .catalog
            .get_episodes(EpisodeQuery {
                series_id,
                limit: if season_id.is_some() {
                    None
                } else {
                    Some(SERIES_EPISODE_LIMIT)
                },
                season_id,
                start_item_id,
                random: options.shuffle,
            })
            .await?;

        if options.shuffle {
            return Ok(ResolvedItems::unchanged(episodes, Some(0)));
        }

        let restrict_to_season = start_season_id.as_ref().filter(|_| items.len() != 1);
        let mut season_start = None;
        let mut first_unplayed = None;
        for (index, episode) in episodes.iter().enumerate() {
            if let Some(season) = restrict_to_season {
                if episode.season_id.as_ref() != Some(season) {
                    continue;
                }
                season_start.get_or_insert(index);
            }
            if !episode.is_played() {
                first_unplayed = Some(index);
                break;
            }
        }

        let start_index = first_unplayed.or(season_start).unwrap_or(0);
        Ok(ResolvedItems::unchanged(episodes, Some(start_index)))
    }

    /// The rest of the series from `episode` on, or `None` when the episode
    /// has no series.
    async fn episodes_from(&self, episode: &PlayableItem) -> Result<Option<ResolvedItems>> {
        let (Some(series_id), Some(id)) = (episode.series_id.clone(), episode.id.clone()) else {
            return Ok(None);
        };

        let episodes = self
            .catalog
            .get_episodes(EpisodeQuery {
                series_id,
                start_item_id: Some(id.clone()),
                limit: Some(SERIES_EPISODE_LIMIT),
                ..EpisodeQuery::default()
            })
            .await?;

        let start_index = episodes
            .iter()
            .position(|e| e.id.as_deref() == Some(id.as_str()));
        Ok(Some(ResolvedItems::unchanged(episodes, start_index)))
    }

    /// Insert the remaining parts after every multi-part movie or episode,
    /// shifting the start index past parts inserted before it.
    pub async fn with_additional_parts(&self, resolved: ResolvedItems) -> ResolvedItems {
        let mut groups: Vec<Vec<PlayableItem>> = Vec::with_capacity(resolved.items.len());

        for item in resolved.items {
            let multi_part = item.part_count.map(|n| n > 1).unwrap_or(false)
                && matches!(item.kind, ItemKind::Episode | ItemKind::Movie);

            let mut group = Vec::new();
            if multi_part {
                if let Some(id) = item.id.as_deref() {
                    match self.catalog.get_additional_parts(id).await {
                        Ok(parts) => group = parts,
                        Err(e) => warn!(item_id = id, error = %e, "Additional parts unavailable"),
                    }
                }
            }
            group.insert(0, item);
            groups.push(group);
        }

        let start_index = resolved
            .start_index
            .map(|start| groups.iter().take(start).map(Vec::len).sum());

        ResolvedItems {
            items: groups.into_iter().flatten().collect(),
            start_index,
        }
    }

    /// Trailers played ahead of `first` when cinema mode is on.
    pub async fn intros(&self, first: &PlayableItem, options: &PlayOptions) -> Vec<PlayableItem> {
        let requested_offset =
            options.start_position_ticks.unwrap_or(0) != 0 || options.start_index.unwrap_or(0) != 0;
        if requested_offset || !options.fullscreen || !self.cinema_mode || !enable_intros(first) {
            return Vec::new();
        }

        let Some(id) = first.id.as_deref() else {
            return Vec::new();
        };

        match self.catalog.get_intros(id).await {
            Ok(intros) => intros,
            Err(e) => {
                debug!(item_id = id, error = %e, "Intros unavailable");
                Vec::new()
            }
        }
    }
}

fn enable_intros(item: &PlayableItem) -> bool {
    item.media_type == MediaType::Video
        && item.kind != ItemKind::TvChannel
        && item.status.as_deref() != Some("InProgress")
        && item.is_server_item()
}

fn sort_fields(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| f.to_string()).collect()
}
