//! # Source Negotiator
//!
//! Produces exactly one [`StreamDescriptor`] per play attempt.
//!
//! ```text
//! renderer ──► device profile ──► catalog playback info ──► rank sources
//!                                                                │
//!                                          open live stream (if required)
//!                                                                │
//!                    StreamDescriptor ◄── URL strategy + text tracks
//! ```
//!
//! Ranking prefers sources that pass the direct-play probe, then
//! direct-stream capable sources, then transcode capable sources, and
//! finally whatever the catalog listed first.
//!
//! URL strategy, in order:
//! 1. direct-play eligible: the source's raw path
//! 2. pre-resolved stream URL: played as a transcode
//! 3. direct-play or direct-stream capable: static stream URL
//! 4. transcode capable: the catalog's transcoding URL
//!
//! Media types other than audio and video always direct play their path.

use crate::error::{PlaybackError, Result};
use crate::registry::RegisteredRenderer;
use crate::tracks::reconcile_secondary_subtitle;
use bridge_traits::{
    CatalogClient, DeviceProfile, LiveStreamRequest, MediaProtocol, MediaSource, MediaType,
    PlayMethod, PlayableItem, PlaybackInfoRequest, PlaybackInfoResponse, ServerEndpoint,
    StreamDescriptor, StreamKind, SubtitleDeliveryMethod, TextTrack, TranscodingSubProtocol,
    NO_COMPATIBLE_STREAM,
};
use core_runtime::logging::redact_url;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Mime type of segmented-manifest transcodes.
pub const SEGMENTED_MANIFEST_MIME: &str = "application/x-mpegURL";

/// Options of one negotiation cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NegotiationRequest {
    pub media_source_id: Option<String>,
    pub live_stream_id: Option<String>,
    pub start_position_ticks: Option<i64>,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    /// Secondary subtitle carried over from the previous item.
    pub secondary_subtitle_stream_index: Option<i32>,
    pub max_streaming_bitrate: Option<u64>,
    pub enable_direct_play: Option<bool>,
    pub enable_direct_stream: Option<bool>,
    pub allow_video_stream_copy: Option<bool>,
    pub allow_audio_stream_copy: Option<bool>,
    pub fullscreen: bool,
}

impl NegotiationRequest {
    /// The transcoding fallback disables direct play explicitly.
    pub fn is_retry(&self) -> bool {
        self.enable_direct_play == Some(false)
    }

    /// Force a full transcode: no direct play, no direct stream, no copy.
    pub fn transcode_only(mut self) -> Self {
        self.enable_direct_play = Some(false);
        self.enable_direct_stream = Some(false);
        self.allow_video_stream_copy = Some(false);
        self.allow_audio_stream_copy = Some(false);
        self
    }

    /// Direct stream as requested, unless the renderer cannot play remuxed
    /// streams at all.
    fn enable_direct_stream_for(&self, renderer: &RegisteredRenderer) -> Option<bool> {
        if self.enable_direct_stream != Some(false)
            && !renderer.descriptor.capabilities.supports_direct_stream
        {
            return Some(false);
        }
        self.enable_direct_stream
    }

    fn playback_info(
        &self,
        renderer: &RegisteredRenderer,
        item: &PlayableItem,
        item_id: &str,
        device_profile: DeviceProfile,
    ) -> PlaybackInfoRequest {
        PlaybackInfoRequest {
            item_id: item_id.to_string(),
            device_profile,
            media_source_id: self.media_source_id.clone(),
            live_stream_id: self.live_stream_id.clone(),
            start_time_ticks: Some(self.start_position_ticks.unwrap_or(0)),
            audio_stream_index: self.audio_stream_index,
            subtitle_stream_index: self.subtitle_stream_index,
            secondary_subtitle_stream_index: self.secondary_subtitle_stream_index,
            max_streaming_bitrate: self.max_streaming_bitrate,
            enable_direct_play: self.enable_direct_play,
            enable_direct_stream: self.enable_direct_stream_for(renderer),
            allow_video_stream_copy: self.allow_video_stream_copy,
            allow_audio_stream_copy: self.allow_audio_stream_copy,
            enable_media_probe: (!renderer.renderer.enable_media_probe(item)).then_some(false),
            direct_play_protocols: renderer.renderer.direct_play_protocols(),
            is_playback: true,
            auto_open_live_stream: true,
        }
    }
}

/// Media source chosen for playback with the outcome of its direct-play probe.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedSource {
    pub source: MediaSource,
    pub direct_play: bool,
    /// Session id handed out by the catalog with the playback info.
    pub play_session_id: Option<String>,
}

pub struct SourceNegotiator {
    catalog: Arc<dyn CatalogClient>,
    enable_remote_direct_play: bool,
}

impl SourceNegotiator {
    pub fn new(catalog: Arc<dyn CatalogClient>, enable_remote_direct_play: bool) -> Self {
        Self {
            catalog,
            enable_remote_direct_play,
        }
    }

    /// Full negotiation cycle for a catalog item on `renderer`.
    ///
    /// The secondary subtitle of the request is folded into the chosen
    /// source, and dropped when the renderer cannot show the pair.
    #[instrument(skip(self, renderer, item, request), fields(renderer = %renderer.id(), item_id = ?item.id))]
    pub async fn negotiate(
        &self,
        renderer: &RegisteredRenderer,
        item: &PlayableItem,
        request: &NegotiationRequest,
    ) -> Result<StreamDescriptor> {
        let device_profile = self.device_profile(renderer, item, request.is_retry()).await?;
        let mut selected = self
            .get_playback_media_source(renderer, item, &device_profile, request)
            .await?;
        reconcile_secondary_subtitle(
            &mut selected.source,
            request.secondary_subtitle_stream_index,
            renderer.descriptor.capabilities.supports_secondary_subtitles,
        );

        self.build_stream_descriptor(item, &selected, request)
    }

    /// Negotiation for a stream change on an item that is already playing.
    ///
    /// The catalog is asked for the current source only, and its first
    /// answer is used as is.
    #[instrument(skip(self, renderer, item, request), fields(renderer = %renderer.id(), item_id = ?item.id))]
    pub async fn renegotiate(
        &self,
        renderer: &RegisteredRenderer,
        item: &PlayableItem,
        request: &NegotiationRequest,
    ) -> Result<StreamDescriptor> {
        let item_id = server_item_id(item)?;
        let device_profile = self.device_profile(renderer, item, request.is_retry()).await?;

        let response = self
            .catalog
            .get_playback_info(request.playback_info(renderer, item, item_id, device_profile))
            .await?;
        validate_playback_info(&response)?;

        let play_session_id = response.play_session_id.clone();
        let source = response
            .media_sources
            .into_iter()
            .next()
            .ok_or_else(|| PlaybackError::NoMediaSource(item_id.to_string()))?;

        let selected = SelectedSource {
            source,
            direct_play: false,
            play_session_id,
        };
        self.build_stream_descriptor(item, &selected, request)
    }

    pub async fn device_profile(
        &self,
        renderer: &RegisteredRenderer,
        item: &PlayableItem,
        is_retry: bool,
    ) -> Result<DeviceProfile> {
        renderer
            .renderer
            .get_device_profile(item, is_retry)
            .await
            .map_err(|e| PlaybackError::Renderer(e.to_string()))
    }

    /// Ask the catalog for sources, pick one, and open it when required.
    pub async fn get_playback_media_source(
        &self,
        renderer: &RegisteredRenderer,
        item: &PlayableItem,
        device_profile: &DeviceProfile,
        request: &NegotiationRequest,
    ) -> Result<SelectedSource> {
        let item_id = server_item_id(item)?;

        if item.media_type == MediaType::Audio
            && renderer.descriptor.capabilities.supports_universal_audio
        {
            let source = self.universal_audio_source(item, device_profile, request)?;
            return Ok(SelectedSource {
                source,
                direct_play: false,
                play_session_id: None,
            });
        }

        let response = self
            .catalog
            .get_playback_info(request.playback_info(
                renderer,
                item,
                item_id,
                device_profile.clone(),
            ))
            .await?;
        validate_playback_info(&response)?;

        let mut selected = self
            .select_optimal_source(response.media_sources)
            .await
            .ok_or_else(|| PlaybackError::NoMediaSource(item_id.to_string()))?;
        selected.play_session_id = response.play_session_id;

        if selected.source.requires_opening && selected.source.live_stream_id.is_none() {
            // Forced track indices do not apply to the opened stream.
            let open = LiveStreamRequest {
                item_id: item_id.to_string(),
                open_token: selected.source.open_token.clone(),
                play_session_id: selected.play_session_id.clone(),
                device_profile: device_profile.clone(),
                start_time_ticks: Some(request.start_position_ticks.unwrap_or(0)),
                max_streaming_bitrate: request.max_streaming_bitrate,
                enable_direct_play: request.enable_direct_play,
                enable_direct_stream: request.enable_direct_stream_for(renderer),
                allow_video_stream_copy: request.allow_video_stream_copy,
                allow_audio_stream_copy: request.allow_audio_stream_copy,
            };

            let opened = self.catalog.open_live_stream(open).await?;
            info!(
                item_id,
                live_stream_id = ?opened.live_stream_id,
                "Opened live stream"
            );

            selected.direct_play = self.supports_direct_play(&opened).await;
            selected.source = opened;
        }

        Ok(selected)
    }

    /// Rank `sources` and return the winner, or `None` for an empty list.
    pub async fn select_optimal_source(&self, sources: Vec<MediaSource>) -> Option<SelectedSource> {
        let probes = join_all(sources.iter().map(|s| self.supports_direct_play(s))).await;
        let candidates: Vec<(MediaSource, bool)> = sources.into_iter().zip(probes).collect();

        let position = candidates
            .iter()
            .position(|(_, direct_play)| *direct_play)
            .or_else(|| candidates.iter().position(|(s, _)| s.supports_direct_stream))
            .or_else(|| candidates.iter().position(|(s, _)| s.supports_transcoding))
            .or(if candidates.is_empty() { None } else { Some(0) })?;

        let (source, direct_play) = candidates.into_iter().nth(position)?;
        debug!(
            media_source_id = %source.id,
            direct_play,
            "Selected media source"
        );

        Some(SelectedSource {
            source,
            direct_play,
            play_session_id: None,
        })
    }

    /// Whether the renderer may fetch `source` straight from its path.
    ///
    /// Only HTTP sources without required headers are probed. When direct
    /// play is the only way to play them they pass outright, otherwise the
    /// host must be reachable from here.
    pub async fn supports_direct_play(&self, source: &MediaSource) -> bool {
        let folder_rip = source.video_type.map(|t| t.is_folder_rip()).unwrap_or(false);
        if !source.supports_direct_play && !folder_rip {
            return false;
        }

        if source.is_remote && !self.enable_remote_direct_play {
            return false;
        }

        if source.protocol == MediaProtocol::Http && source.required_http_headers.is_empty() {
            if !source.supports_direct_stream && !source.supports_transcoding {
                return true;
            }
            return self.is_host_reachable(source).await;
        }

        false
    }

    async fn is_host_reachable(&self, source: &MediaSource) -> bool {
        if source.is_remote {
            return true;
        }

        let endpoint = match self.catalog.get_endpoint_info().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(error = %e, "Endpoint info unavailable, treating host as unreachable");
                return false;
            }
        };

        if !endpoint.is_in_network {
            return false;
        }

        if !endpoint.is_local {
            let path = source.path.as_deref().unwrap_or_default().to_ascii_lowercase();
            // Loopback paths only resolve on the server's own machine.
            if path.contains("localhost") || path.contains("127.0.0.1") {
                return false;
            }
        }

        true
    }

    /// Apply the URL strategy to `selected` and derive the text tracks.
    pub fn build_stream_descriptor(
        &self,
        item: &PlayableItem,
        selected: &SelectedSource,
        request: &NegotiationRequest,
    ) -> Result<StreamDescriptor> {
        let endpoint = self.catalog.server_endpoint();
        let source = &selected.source;
        let media_type = item.media_type;
        let container = source
            .container
            .as_deref()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let start_position_ticks = request.start_position_ticks;

        let mut url: Option<String> = None;
        let mut mime_type = None;
        let mut play_method = PlayMethod::Transcode;
        let mut transcoding_offset_ticks = 0;

        if media_type.is_streamable() {
            mime_type = Some(get_mime_type(media_type, &container));

            if selected.direct_play {
                url = source.path.clone();
                play_method = PlayMethod::DirectPlay;
            } else if let Some(stream_url) = source.stream_url.as_ref() {
                url = Some(stream_url.clone());
            } else if source.supports_direct_play || source.supports_direct_stream {
                let item_id = server_item_id(item)?;
                let prefix = if media_type == MediaType::Video {
                    "Videos"
                } else {
                    "Audio"
                };

                let mut params = vec![
                    ("Static", "true".to_string()),
                    ("mediaSourceId", source.id.clone()),
                    ("deviceId", endpoint.device_id.clone()),
                ];
                if let Some(token) = endpoint.access_token.as_ref() {
                    params.push(("api_key", token.clone()));
                }
                if let Some(tag) = source.etag.as_ref() {
                    params.push(("Tag", tag.clone()));
                }
                if let Some(live_stream_id) = source.live_stream_id.as_ref() {
                    params.push(("LiveStreamId", live_stream_id.clone()));
                }

                url = Some(server_url(
                    &endpoint,
                    &format!("{}/{}/stream.{}", prefix, item_id, container),
                    &params,
                )?);
                play_method = if source.supports_direct_play {
                    PlayMethod::DirectPlay
                } else {
                    PlayMethod::DirectStream
                };
            } else if source.supports_transcoding {
                if let Some(transcoding_url) = source.transcoding_url.as_deref() {
                    let resolved = server_url(&endpoint, transcoding_url, &[])?;

                    if source.transcoding_sub_protocol == Some(TranscodingSubProtocol::Hls) {
                        mime_type = Some(SEGMENTED_MANIFEST_MIME.to_string());
                    } else {
                        let transcoding_container = source
                            .transcoding_container
                            .as_deref()
                            .unwrap_or_default()
                            .to_ascii_lowercase();
                        mime_type = Some(get_mime_type(media_type, &transcoding_container));

                        if !resolved.to_ascii_lowercase().contains("copytimestamps=true") {
                            transcoding_offset_ticks = start_position_ticks.unwrap_or(0);
                        }
                    }

                    url = Some(resolved);
                }
            }
        } else {
            url = source.path.clone();
            play_method = PlayMethod::DirectPlay;
        }

        // Offline items carry nothing but a path.
        if url.is_none() && source.supports_direct_play {
            url = source.path.clone();
            play_method = PlayMethod::DirectPlay;
        }

        let url = url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| PlaybackError::NoStreamUrl(source.id.clone()))?;

        let play_session_id = play_session_id_from_url(&url).or_else(|| selected.play_session_id.clone());

        debug!(
            url = %redact_url(&url),
            %play_method,
            transcoding_offset_ticks,
            "Built stream descriptor"
        );

        Ok(StreamDescriptor {
            url,
            mime_type,
            play_method,
            media_type,
            item: item.clone(),
            media_source: Some(source.clone()),
            transcoding_offset_ticks,
            start_position_ticks,
            audio_stream_index: request
                .audio_stream_index
                .or(source.default_audio_stream_index),
            subtitle_stream_index: request
                .subtitle_stream_index
                .or(source.default_subtitle_stream_index),
            play_session_id,
            live_stream_id: source.live_stream_id.clone(),
            text_tracks: text_tracks(&endpoint, source),
            title: item.name.clone(),
            fullscreen: request.fullscreen,
        })
    }

    /// Synthesised source pointing at the catalog's universal audio
    /// endpoint, which decides between direct play and transcoding itself.
    pub fn universal_audio_source(
        &self,
        item: &PlayableItem,
        device_profile: &DeviceProfile,
        request: &NegotiationRequest,
    ) -> Result<MediaSource> {
        let item_id = server_item_id(item)?;
        let endpoint = self.catalog.server_endpoint();

        let containers = device_profile
            .direct_play_profiles
            .iter()
            .filter(|p| p.kind == Some(MediaType::Audio))
            .map(|p| match p.audio_codec.as_deref() {
                Some(codec) if !codec.is_empty() => format!("{}|{}", p.container, codec),
                _ => p.container.clone(),
            })
            .collect::<Vec<_>>()
            .join(",");
        let transcoding = device_profile
            .transcoding_profiles
            .iter()
            .find(|p| p.kind == Some(MediaType::Audio));

        let mut params = vec![("DeviceId", endpoint.device_id.clone())];
        if let Some(bitrate) = request
            .max_streaming_bitrate
            .or(device_profile.max_streaming_bitrate)
        {
            params.push(("MaxStreamingBitrate", bitrate.to_string()));
        }
        params.push(("Container", containers));
        if let Some(profile) = transcoding {
            params.push(("TranscodingContainer", profile.container.clone()));
            if let Some(protocol) = profile.protocol {
                let protocol = match protocol {
                    TranscodingSubProtocol::Hls => "hls",
                    TranscodingSubProtocol::Http => "http",
                };
                params.push(("TranscodingProtocol", protocol.to_string()));
            }
            if let Some(codec) = profile.audio_codec.as_ref() {
                params.push(("AudioCodec", codec.clone()));
            }
        }
        if let Some(token) = endpoint.access_token.as_ref() {
            params.push(("api_key", token.clone()));
        }
        params.push(("PlaySessionId", uuid::Uuid::new_v4().simple().to_string()));
        params.push((
            "StartTimeTicks",
            request.start_position_ticks.unwrap_or(0).to_string(),
        ));
        params.push(("EnableRedirection", "true".to_string()));
        params.push((
            "EnableRemoteMedia",
            self.enable_remote_direct_play.to_string(),
        ));

        let stream_url = server_url(&endpoint, &format!("Audio/{}/universal", item_id), &params)?;

        Ok(MediaSource {
            id: item_id.to_string(),
            stream_url: Some(stream_url),
            run_time_ticks: item.run_time_ticks,
            ..MediaSource::default()
        })
    }

    /// Bitrate ceiling for `item`: measured when detection is enabled and
    /// the item is streamed from the catalog, `fallback` otherwise.
    pub async fn detect_max_bitrate(
        &self,
        item: &PlayableItem,
        detection_enabled: bool,
        fallback: u64,
    ) -> u64 {
        if !detection_enabled || !item.is_server_item() || !item.media_type.is_streamable() {
            return fallback;
        }

        match self.catalog.detect_bitrate().await {
            Ok(bitrate) if bitrate > 0 => {
                debug!(bitrate, "Detected bitrate");
                bitrate
            }
            Ok(_) => fallback,
            Err(e) => {
                debug!(error = %e, "Bitrate detection skipped");
                fallback
            }
        }
    }
}

/// Descriptor for an item that is not backed by the catalog.
pub fn url_item_descriptor(item: &PlayableItem, fullscreen: bool) -> Result<StreamDescriptor> {
    let url = item
        .direct_url()
        .ok_or_else(|| PlaybackError::InvalidRequest("item has neither id nor url".to_string()))?;

    Ok(StreamDescriptor {
        url: url.to_string(),
        mime_type: None,
        play_method: PlayMethod::DirectPlay,
        media_type: item.media_type,
        item: item.clone(),
        media_source: None,
        transcoding_offset_ticks: 0,
        start_position_ticks: None,
        audio_stream_index: None,
        subtitle_stream_index: None,
        play_session_id: None,
        live_stream_id: None,
        text_tracks: Vec::new(),
        title: item.name.clone(),
        fullscreen,
    })
}

/// Reject responses that carry an error code.
pub fn validate_playback_info(response: &PlaybackInfoResponse) -> Result<()> {
    match response.error_code.as_deref() {
        None => Ok(()),
        Some(NO_COMPATIBLE_STREAM) => Err(PlaybackError::NoCompatibleStream),
        Some(code) => Err(PlaybackError::ServerError {
            code: code.to_string(),
        }),
    }
}

pub fn get_mime_type(media_type: MediaType, container: &str) -> String {
    let container = container.to_ascii_lowercase();

    let known = match (media_type, container.as_str()) {
        (MediaType::Audio, "opus") => Some("audio/ogg"),
        (MediaType::Audio, "webma") => Some("audio/webm"),
        (MediaType::Audio, "m4a") => Some("audio/mp4"),
        (MediaType::Video, "mkv") => Some("video/x-matroska"),
        (MediaType::Video, "m4v") => Some("video/mp4"),
        (MediaType::Video, "mov") => Some("video/quicktime"),
        (MediaType::Video, "mpg") => Some("video/mpeg"),
        (MediaType::Video, "flv") => Some("video/x-flv"),
        _ => None,
    };

    match known {
        Some(mime) => mime.to_string(),
        None => format!("{}/{}", media_type.as_lowercase(), container),
    }
}

/// `playSessionId` query value, matched case-insensitively.
pub fn play_session_id_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key.eq_ignore_ascii_case("playSessionId"))
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Sidecar subtitle tracks of `source`.
pub fn text_tracks(endpoint: &ServerEndpoint, source: &MediaSource) -> Vec<TextTrack> {
    source
        .media_streams
        .iter()
        .filter(|s| s.is_kind(StreamKind::Subtitle))
        .filter(|s| s.delivery_method == Some(SubtitleDeliveryMethod::External))
        .filter_map(|stream| {
            let delivery_url = stream.delivery_url.as_deref()?;
            let url = if stream.is_external_url {
                delivery_url.to_string()
            } else {
                server_url(endpoint, delivery_url, &[]).ok()?
            };

            Some(TextTrack {
                url,
                language: stream
                    .language
                    .clone()
                    .unwrap_or_else(|| "und".to_string()),
                is_default: Some(stream.index) == source.default_subtitle_stream_index,
                index: stream.index,
                format: stream.codec.clone(),
            })
        })
        .collect()
}

fn server_item_id(item: &PlayableItem) -> Result<&str> {
    item.id
        .as_deref()
        .ok_or_else(|| PlaybackError::InvalidRequest("item is not a catalog item".to_string()))
}

/// Resolve `path` against the endpoint and append `params` to its query.
/// Absolute URLs are kept as they are.
fn server_url(endpoint: &ServerEndpoint, path: &str, params: &[(&str, String)]) -> Result<String> {
    let raw = if Url::parse(path).is_ok() {
        path.to_string()
    } else {
        format!(
            "{}/{}",
            endpoint.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    };

    let mut url = Url::parse(&raw).map_err(|e| {
        PlaybackError::InvalidRequest(format!("invalid stream url {}: {}", redact_url(&raw), e))
    })?;

    if !params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            pairs.append_pair(key, value);
        }
    }

    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::media::{DirectPlayProfile, TranscodingProfile};
    use bridge_traits::{
        BridgeError, EndpointInfo, EpisodeQuery, ItemKind, ItemQuery,
        MediaStream, Renderer, RendererCapabilities, RendererDescriptor, VideoType,
    };
    use parking_lot::Mutex;
    use std::time::Duration;

    struct FakeCatalog {
        response: PlaybackInfoResponse,
        endpoint: EndpointInfo,
        opened: Option<MediaSource>,
        requests: Mutex<Vec<PlaybackInfoRequest>>,
        live_requests: Mutex<Vec<LiveStreamRequest>>,
    }

    impl FakeCatalog {
        fn with_sources(sources: Vec<MediaSource>) -> Self {
            Self {
                response: PlaybackInfoResponse {
                    media_sources: sources,
                    play_session_id: Some("session-1".to_string()),
                    error_code: None,
                },
                endpoint: EndpointInfo {
                    is_in_network: true,
                    is_local: true,
                },
                opened: None,
                requests: Mutex::new(Vec::new()),
                live_requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CatalogClient for FakeCatalog {
        fn server_endpoint(&self) -> ServerEndpoint {
            ServerEndpoint {
                base_url: "https://media.example.org/".to_string(),
                device_id: "device-1".to_string(),
                access_token: Some("secret".to_string()),
            }
        }

        async fn get_item(&self, item_id: &str) -> BridgeResult<PlayableItem> {
            Err(BridgeError::OperationFailed(format!("no item {}", item_id)))
        }

        async fn resolve_items(&self, _query: ItemQuery) -> BridgeResult<Vec<PlayableItem>> {
            Ok(Vec::new())
        }

        async fn get_episodes(&self, _query: EpisodeQuery) -> BridgeResult<Vec<PlayableItem>> {
            Ok(Vec::new())
        }

        async fn get_playback_info(
            &self,
            request: PlaybackInfoRequest,
        ) -> BridgeResult<PlaybackInfoResponse> {
            self.requests.lock().push(request);
            Ok(self.response.clone())
        }

        async fn get_endpoint_info(&self) -> BridgeResult<EndpointInfo> {
            Ok(self.endpoint)
        }

        async fn open_live_stream(&self, request: LiveStreamRequest) -> BridgeResult<MediaSource> {
            self.live_requests.lock().push(request);
            self.opened
                .clone()
                .ok_or_else(|| BridgeError::Unsupported("open_live_stream".to_string()))
        }
    }

    struct ProfileRenderer {
        descriptor: RendererDescriptor,
        profile: DeviceProfile,
        media_probe: bool,
        protocols: Option<Vec<MediaProtocol>>,
    }

    #[async_trait]
    impl Renderer for ProfileRenderer {
        fn descriptor(&self) -> RendererDescriptor {
            self.descriptor.clone()
        }

        async fn get_device_profile(&self, _: &PlayableItem, _: bool) -> BridgeResult<DeviceProfile> {
            Ok(self.profile.clone())
        }

        fn enable_media_probe(&self, _item: &PlayableItem) -> bool {
            self.media_probe
        }

        fn direct_play_protocols(&self) -> Option<Vec<MediaProtocol>> {
            self.protocols.clone()
        }

        async fn play(&self, _stream: StreamDescriptor) -> BridgeResult<()> {
            Ok(())
        }

        async fn pause(&self) -> BridgeResult<()> {
            Ok(())
        }

        async fn unpause(&self) -> BridgeResult<()> {
            Ok(())
        }

        async fn stop(&self, _destroy: bool) -> BridgeResult<()> {
            Ok(())
        }

        async fn set_current_time(&self, _position: Duration) -> BridgeResult<()> {
            Ok(())
        }

        fn current_time(&self) -> Option<Duration> {
            None
        }

        fn duration(&self) -> Option<Duration> {
            None
        }

        fn is_paused(&self) -> bool {
            false
        }
    }

    fn registered(capabilities: RendererCapabilities) -> RegisteredRenderer {
        with_overrides(capabilities, true, None)
    }

    fn with_overrides(
        capabilities: RendererCapabilities,
        media_probe: bool,
        protocols: Option<Vec<MediaProtocol>>,
    ) -> RegisteredRenderer {
        let descriptor = RendererDescriptor::new("local", "Local")
            .with_media_types([MediaType::Audio, MediaType::Video])
            .with_capabilities(capabilities);
        let profile = DeviceProfile {
            max_streaming_bitrate: Some(8_000_000),
            direct_play_profiles: vec![
                DirectPlayProfile {
                    container: "mp3".to_string(),
                    audio_codec: Some("mp3".to_string()),
                    video_codec: None,
                    kind: Some(MediaType::Audio),
                },
                DirectPlayProfile {
                    container: "flac".to_string(),
                    audio_codec: None,
                    video_codec: None,
                    kind: Some(MediaType::Audio),
                },
            ],
            transcoding_profiles: vec![TranscodingProfile {
                container: "ts".to_string(),
                kind: Some(MediaType::Audio),
                audio_codec: Some("aac".to_string()),
                video_codec: None,
                protocol: Some(TranscodingSubProtocol::Hls),
            }],
            ..DeviceProfile::default()
        };
        RegisteredRenderer {
            descriptor: descriptor.clone(),
            renderer: Arc::new(ProfileRenderer {
                descriptor,
                profile,
                media_probe,
                protocols,
            }),
        }
    }

    fn movie() -> PlayableItem {
        PlayableItem::new("movie-1", ItemKind::Movie, MediaType::Video).with_name("Movie")
    }

    fn http_direct_source(id: &str) -> MediaSource {
        MediaSource {
            protocol: MediaProtocol::Http,
            path: Some(format!("https://cdn.example.org/{}.mkv", id)),
            container: Some("mkv".to_string()),
            supports_direct_play: true,
            supports_direct_stream: true,
            supports_transcoding: true,
            ..MediaSource::new(id)
        }
    }

    fn hls_source() -> MediaSource {
        MediaSource {
            supports_transcoding: true,
            transcoding_url: Some(
                "/videos/movie-1/master.m3u8?PlaySessionId=abc123&api_key=secret".to_string(),
            ),
            transcoding_sub_protocol: Some(TranscodingSubProtocol::Hls),
            transcoding_container: Some("ts".to_string()),
            ..MediaSource::new("ms-hls")
        }
    }

    fn build_negotiator(catalog: FakeCatalog) -> (SourceNegotiator, Arc<FakeCatalog>) {
        let catalog = Arc::new(catalog);
        (SourceNegotiator::new(catalog.clone(), true), catalog)
    }

    #[tokio::test]
    async fn test_reachable_local_source_direct_plays() {
        let (negotiator, _) = build_negotiator(FakeCatalog::with_sources(vec![http_direct_source("ms1")]));
        let renderer = registered(RendererCapabilities::default());

        let stream = negotiator
            .negotiate(&renderer, &movie(), &NegotiationRequest::default())
            .await
            .unwrap();

        assert_eq!(stream.play_method, PlayMethod::DirectPlay);
        assert_eq!(stream.url, "https://cdn.example.org/ms1.mkv");
        assert_eq!(stream.mime_type.as_deref(), Some("video/x-matroska"));
    }

    #[tokio::test]
    async fn test_segmented_transcode_has_no_local_offset() {
        let (negotiator, _) = build_negotiator(FakeCatalog::with_sources(vec![hls_source()]));
        let renderer = registered(RendererCapabilities::default());
        let request = NegotiationRequest {
            start_position_ticks: Some(600_000_000),
            ..NegotiationRequest::default()
        };

        let stream = negotiator.negotiate(&renderer, &movie(), &request).await.unwrap();

        assert_eq!(stream.play_method, PlayMethod::Transcode);
        assert_eq!(stream.mime_type.as_deref(), Some(SEGMENTED_MANIFEST_MIME));
        assert_eq!(stream.transcoding_offset_ticks, 0);
        assert!(stream.url.starts_with("https://media.example.org/videos/movie-1/master.m3u8"));
        assert_eq!(stream.play_session_id.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_continuous_transcode_offsets_by_start() {
        let mut source = hls_source();
        source.transcoding_sub_protocol = Some(TranscodingSubProtocol::Http);
        source.transcoding_url = Some("/videos/movie-1/stream.mp4?api_key=secret".to_string());
        source.transcoding_container = Some("mp4".to_string());
        let (negotiator, _) = build_negotiator(FakeCatalog::with_sources(vec![source.clone()]));
        let renderer = registered(RendererCapabilities::default());
        let request = NegotiationRequest {
            start_position_ticks: Some(42),
            ..NegotiationRequest::default()
        };

        let stream = negotiator.negotiate(&renderer, &movie(), &request).await.unwrap();
        assert_eq!(stream.mime_type.as_deref(), Some("video/mp4"));
        assert_eq!(stream.transcoding_offset_ticks, 42);
        // Falls back to the catalog's session id.
        assert_eq!(stream.play_session_id.as_deref(), Some("session-1"));

        source.transcoding_url =
            Some("/videos/movie-1/stream.mp4?CopyTimestamps=true".to_string());
        let (negotiator, _) = build_negotiator(FakeCatalog::with_sources(vec![source]));
        let stream = negotiator.negotiate(&renderer, &movie(), &request).await.unwrap();
        assert_eq!(stream.transcoding_offset_ticks, 0);
    }

    #[tokio::test]
    async fn test_ranking_prefers_direct_stream_over_transcode() {
        let transcode = MediaSource {
            supports_transcoding: true,
            ..MediaSource::new("transcode")
        };
        let direct_stream = MediaSource {
            supports_direct_stream: true,
            container: Some("mp4".to_string()),
            ..MediaSource::new("remux")
        };
        let (negotiator, _) = build_negotiator(FakeCatalog::with_sources(Vec::new()));

        let selected = negotiator
            .select_optimal_source(vec![transcode.clone(), direct_stream])
            .await
            .unwrap();
        assert_eq!(selected.source.id, "remux");
        assert!(!selected.direct_play);

        let bare = MediaSource::new("bare");
        let selected = negotiator
            .select_optimal_source(vec![bare, MediaSource::new("other")])
            .await
            .unwrap();
        assert_eq!(selected.source.id, "bare");

        assert!(negotiator.select_optimal_source(Vec::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_static_url_for_direct_stream() {
        let source = MediaSource {
            supports_direct_stream: true,
            container: Some("MP4".to_string()),
            etag: Some("etag-1".to_string()),
            ..MediaSource::new("ms2")
        };
        let (negotiator, _) = build_negotiator(FakeCatalog::with_sources(vec![source]));
        let renderer = registered(RendererCapabilities::default());

        let stream = negotiator
            .negotiate(&renderer, &movie(), &NegotiationRequest::default())
            .await
            .unwrap();

        assert_eq!(stream.play_method, PlayMethod::DirectStream);
        let url = Url::parse(&stream.url).unwrap();
        assert_eq!(url.path(), "/Videos/movie-1/stream.mp4");
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(query.contains(&("Static".to_string(), "true".to_string())));
        assert!(query.contains(&("mediaSourceId".to_string(), "ms2".to_string())));
        assert!(query.contains(&("deviceId".to_string(), "device-1".to_string())));
        assert!(query.contains(&("Tag".to_string(), "etag-1".to_string())));
    }

    #[tokio::test]
    async fn test_direct_play_probe() {
        let mut catalog = FakeCatalog::with_sources(Vec::new());
        catalog.endpoint = EndpointInfo {
            is_in_network: true,
            is_local: false,
        };
        let (negotiator, _) = build_negotiator(catalog);

        // Loopback path from a non-local connection.
        let mut loopback = http_direct_source("lo");
        loopback.path = Some("http://127.0.0.1:8096/file.mkv".to_string());
        assert!(!negotiator.supports_direct_play(&loopback).await);

        // Only way to play it.
        loopback.supports_direct_stream = false;
        loopback.supports_transcoding = false;
        assert!(negotiator.supports_direct_play(&loopback).await);

        // Required headers disqualify.
        let mut headers = http_direct_source("hdr");
        headers
            .required_http_headers
            .insert("Referer".to_string(), "x".to_string());
        assert!(!negotiator.supports_direct_play(&headers).await);

        // Folder rips qualify without the flag.
        let mut rip = http_direct_source("rip");
        rip.supports_direct_play = false;
        rip.video_type = Some(VideoType::BluRay);
        assert!(negotiator.supports_direct_play(&rip).await);

        // File protocol never passes the probe.
        let file = MediaSource {
            supports_direct_play: true,
            ..MediaSource::new("file")
        };
        assert!(!negotiator.supports_direct_play(&file).await);
    }

    #[tokio::test]
    async fn test_remote_direct_play_can_be_disabled() {
        let catalog = Arc::new(FakeCatalog::with_sources(Vec::new()));
        let negotiator = SourceNegotiator::new(catalog, false);
        let mut remote = http_direct_source("remote");
        remote.is_remote = true;

        assert!(!negotiator.supports_direct_play(&remote).await);
    }

    #[tokio::test]
    async fn test_error_codes_abort() {
        let mut catalog = FakeCatalog::with_sources(vec![hls_source()]);
        catalog.response.error_code = Some(NO_COMPATIBLE_STREAM.to_string());
        let (negotiator, _) = build_negotiator(catalog);
        let renderer = registered(RendererCapabilities::default());

        let err = negotiator
            .negotiate(&renderer, &movie(), &NegotiationRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err, PlaybackError::NoCompatibleStream);

        let mut catalog = FakeCatalog::with_sources(vec![hls_source()]);
        catalog.response.error_code = Some("NotAllowed".to_string());
        let (negotiator, _) = build_negotiator(catalog);
        let err = negotiator
            .negotiate(&renderer, &movie(), &NegotiationRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.localization_key(), "PlaybackError.NotAllowed");
    }

    #[tokio::test]
    async fn test_empty_sources_are_fatal() {
        let (negotiator, _) = build_negotiator(FakeCatalog::with_sources(Vec::new()));
        let renderer = registered(RendererCapabilities::default());

        let err = negotiator
            .negotiate(&renderer, &movie(), &NegotiationRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlaybackError::NoMediaSource(_)));
    }

    #[tokio::test]
    async fn test_live_stream_is_opened() {
        let closed = MediaSource {
            requires_opening: true,
            open_token: Some("token-1".to_string()),
            ..MediaSource::new("tuner")
        };
        let opened = MediaSource {
            live_stream_id: Some("live-1".to_string()),
            supports_direct_stream: true,
            container: Some("ts".to_string()),
            ..MediaSource::new("tuner")
        };
        let mut catalog = FakeCatalog::with_sources(vec![closed]);
        catalog.opened = Some(opened);
        let (negotiator, catalog) = build_negotiator(catalog);
        let renderer = registered(RendererCapabilities::default());
        let channel = PlayableItem::new("channel-1", ItemKind::TvChannel, MediaType::Video);
        let request = NegotiationRequest {
            audio_stream_index: Some(2),
            ..NegotiationRequest::default()
        };

        let stream = negotiator.negotiate(&renderer, &channel, &request).await.unwrap();

        assert_eq!(stream.live_stream_id.as_deref(), Some("live-1"));
        assert!(stream.url.contains("LiveStreamId=live-1"));
        let live = catalog.live_requests.lock();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].open_token.as_deref(), Some("token-1"));
        assert_eq!(live[0].play_session_id.as_deref(), Some("session-1"));
    }

    #[tokio::test]
    async fn test_universal_audio_skips_playback_info() {
        let (negotiator, catalog) = build_negotiator(FakeCatalog::with_sources(Vec::new()));
        let renderer = registered(RendererCapabilities {
            supports_universal_audio: true,
            ..RendererCapabilities::default()
        });
        let track = PlayableItem::new("song-1", ItemKind::Audio, MediaType::Audio)
            .with_run_time_ticks(1_800_000_000);

        let stream = negotiator
            .negotiate(&renderer, &track, &NegotiationRequest::default())
            .await
            .unwrap();

        assert!(catalog.requests.lock().is_empty());
        assert_eq!(stream.play_method, PlayMethod::Transcode);
        let url = Url::parse(&stream.url).unwrap();
        assert_eq!(url.path(), "/Audio/song-1/universal");
        let container = url
            .query_pairs()
            .find(|(k, _)| k == "Container")
            .map(|(_, v)| v.into_owned());
        assert_eq!(container.as_deref(), Some("mp3|mp3,flac"));
        assert!(stream.play_session_id.is_some());
        assert_eq!(
            stream.media_source.as_ref().and_then(|s| s.run_time_ticks),
            Some(1_800_000_000)
        );
    }

    #[tokio::test]
    async fn test_retry_request_flags() {
        let (negotiator, catalog) = build_negotiator(FakeCatalog::with_sources(vec![hls_source()]));
        let renderer = registered(RendererCapabilities::default());
        let request = NegotiationRequest::default().transcode_only();
        assert!(request.is_retry());

        negotiator.renegotiate(&renderer, &movie(), &request).await.unwrap();

        let sent = catalog.requests.lock();
        assert_eq!(sent[0].enable_direct_play, Some(false));
        assert_eq!(sent[0].enable_direct_stream, Some(false));
        assert_eq!(sent[0].allow_video_stream_copy, Some(false));
        assert_eq!(sent[0].allow_audio_stream_copy, Some(false));
    }

    #[tokio::test]
    async fn test_renderer_overrides_reach_playback_info() {
        let (negotiator, catalog) = build_negotiator(FakeCatalog::with_sources(vec![hls_source()]));
        let renderer = with_overrides(
            RendererCapabilities {
                supports_direct_stream: false,
                ..RendererCapabilities::default()
            },
            false,
            Some(vec![MediaProtocol::Http]),
        );
        let request = NegotiationRequest {
            secondary_subtitle_stream_index: Some(4),
            ..NegotiationRequest::default()
        };

        negotiator.negotiate(&renderer, &movie(), &request).await.unwrap();

        let sent = catalog.requests.lock();
        assert_eq!(sent[0].enable_direct_stream, Some(false));
        assert_eq!(sent[0].enable_media_probe, Some(false));
        assert_eq!(sent[0].direct_play_protocols, Some(vec![MediaProtocol::Http]));
        assert_eq!(sent[0].secondary_subtitle_stream_index, Some(4));
        drop(sent);

        // Defaults leave the catalog to decide.
        let (negotiator, catalog) = build_negotiator(FakeCatalog::with_sources(vec![hls_source()]));
        let renderer = registered(RendererCapabilities::default());
        negotiator
            .negotiate(&renderer, &movie(), &NegotiationRequest::default())
            .await
            .unwrap();

        let sent = catalog.requests.lock();
        assert_eq!(sent[0].enable_direct_stream, None);
        assert_eq!(sent[0].enable_media_probe, None);
        assert_eq!(sent[0].direct_play_protocols, None);
    }

    #[tokio::test]
    async fn test_live_stream_open_honours_direct_stream_capability() {
        let closed = MediaSource {
            requires_opening: true,
            ..MediaSource::new("tuner")
        };
        let opened = MediaSource {
            live_stream_id: Some("live-1".to_string()),
            supports_transcoding: true,
            transcoding_url: Some("/videos/channel-1/live.m3u8".to_string()),
            transcoding_sub_protocol: Some(TranscodingSubProtocol::Hls),
            ..MediaSource::new("tuner")
        };
        let mut catalog = FakeCatalog::with_sources(vec![closed]);
        catalog.opened = Some(opened);
        let (negotiator, catalog) = build_negotiator(catalog);
        let renderer = registered(RendererCapabilities {
            supports_direct_stream: false,
            ..RendererCapabilities::default()
        });
        let channel = PlayableItem::new("channel-1", ItemKind::TvChannel, MediaType::Video);

        negotiator
            .negotiate(&renderer, &channel, &NegotiationRequest::default())
            .await
            .unwrap();

        assert_eq!(catalog.live_requests.lock()[0].enable_direct_stream, Some(false));
    }

    #[tokio::test]
    async fn test_secondary_subtitle_is_folded_into_source() {
        let subtitle = |index: i32| {
            MediaStream::new(index, StreamKind::Subtitle)
                .with_codec("srt")
                .with_delivery(SubtitleDeliveryMethod::External)
                .with_delivery_url(&format!("/Videos/movie-1/Subtitles/{}/Stream.srt", index))
        };
        let mut source = hls_source();
        source.default_subtitle_stream_index = Some(3);
        source.media_streams = vec![subtitle(3), subtitle(4)];
        let request = NegotiationRequest {
            secondary_subtitle_stream_index: Some(4),
            ..NegotiationRequest::default()
        };

        let (negotiator, _) = build_negotiator(FakeCatalog::with_sources(vec![source.clone()]));
        let renderer = registered(RendererCapabilities {
            supports_secondary_subtitles: true,
            ..RendererCapabilities::default()
        });
        let stream = negotiator.negotiate(&renderer, &movie(), &request).await.unwrap();
        let chosen = stream.media_source.unwrap();
        assert_eq!(chosen.default_subtitle_stream_index, Some(3));
        assert_eq!(chosen.default_secondary_subtitle_stream_index, Some(4));

        // Renderers without secondary subtitles drop the pair.
        let (negotiator, _) = build_negotiator(FakeCatalog::with_sources(vec![source]));
        let renderer = registered(RendererCapabilities::default());
        let stream = negotiator.negotiate(&renderer, &movie(), &request).await.unwrap();
        assert_eq!(
            stream.media_source.unwrap().default_secondary_subtitle_stream_index,
            Some(crate::tracks::NO_STREAM)
        );
    }

    #[test]
    fn test_mime_types() {
        assert_eq!(get_mime_type(MediaType::Audio, "opus"), "audio/ogg");
        assert_eq!(get_mime_type(MediaType::Audio, "M4A"), "audio/mp4");
        assert_eq!(get_mime_type(MediaType::Video, "mov"), "video/quicktime");
        assert_eq!(get_mime_type(MediaType::Video, "webm"), "video/webm");
        assert_eq!(get_mime_type(MediaType::Audio, "mkv"), "audio/mkv");
    }

    #[test]
    fn test_play_session_id_from_url() {
        assert_eq!(
            play_session_id_from_url("https://h/master.m3u8?PLAYSESSIONID=x1&a=b").as_deref(),
            Some("x1")
        );
        assert_eq!(play_session_id_from_url("https://h/file.mkv"), None);
        assert_eq!(play_session_id_from_url("not a url"), None);
    }

    #[test]
    fn test_text_tracks_only_external() {
        let endpoint = ServerEndpoint {
            base_url: "https://media.example.org".to_string(),
            device_id: "d".to_string(),
            access_token: None,
        };
        let mut source = MediaSource::new("ms");
        source.default_subtitle_stream_index = Some(3);
        source.media_streams = vec![
            MediaStream::new(2, StreamKind::Subtitle).with_delivery(SubtitleDeliveryMethod::Embed),
            MediaStream::new(3, StreamKind::Subtitle)
                .with_codec("srt")
                .with_delivery(SubtitleDeliveryMethod::External)
                .with_delivery_url("/Videos/x/Subtitles/3/Stream.srt"),
            MediaStream {
                is_external_url: true,
                ..MediaStream::new(4, StreamKind::Subtitle)
                    .with_language("fre")
                    .with_delivery(SubtitleDeliveryMethod::External)
                    .with_delivery_url("https://subs.example.org/4.vtt")
            },
        ];

        let tracks = text_tracks(&endpoint, &source);
        assert_eq!(tracks.len(), 2);
        assert_eq!(
            tracks[0].url,
            "https://media.example.org/Videos/x/Subtitles/3/Stream.srt"
        );
        assert_eq!(tracks[0].language, "und");
        assert!(tracks[0].is_default);
        assert_eq!(tracks[0].format.as_deref(), Some("srt"));
        assert_eq!(tracks[1].url, "https://subs.example.org/4.vtt");
        assert!(!tracks[1].is_default);
    }

    #[test]
    fn test_url_item_descriptor() {
        let item = PlayableItem::from_url("https://radio.example.org/live", MediaType::Audio);
        let stream = url_item_descriptor(&item, false).unwrap();
        assert_eq!(stream.play_method, PlayMethod::DirectPlay);
        assert!(stream.media_source.is_none());

        let empty = PlayableItem::default();
        assert!(url_item_descriptor(&empty, true).is_err());
    }
}
