//! Period and representation bookkeeping.
//!
//! A [`PeriodHolder`] pins one adaptation set of one manifest period for a track, owns a
//! [`RepresentationHolder`] per representation in that set, and carries the attributes that do
//! not depend on which representation is selected. Holders live on the driver task and are
//! rebuilt against each new manifest snapshot; representation holders absorb live-window slides
//! by maintaining a segment-number shift so external segment numbers stay stable across
//! refreshes.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::demux::{
    demuxer_handle, DemuxerFactory, DemuxerHandle, MediaFormat, AUDIO_OBJECT_TYPE_AAC,
    AUDIO_OBJECT_TYPE_AC3, AUDIO_OBJECT_TYPE_EAC3,
};
use crate::drm::DrmInitData;
use crate::mpd::{
    mime_type_matches, AdaptationSet, AdaptationType, MediaPresentation, RangedUri,
    Representation, SegmentIndexRef, INDEX_UNBOUNDED, UNKNOWN_DURATION_US,
};
use crate::playback_rate::PlaybackRate;
use crate::DashError;

/// Mime type of the raw caption container that may arrive as one file spanning the whole asset.
pub const MIME_RAWCC: &str = "application/x-rawcc";

/// What a track wants from adaptation-set selection. Empty/zero preferences have no effect on
/// the ranking; only the mime glob is a hard filter.
#[derive(Debug, Clone)]
pub struct TrackCriteria {
    pub mime_glob: String,
    pub prefer_trick: bool,
    pub preferred_lang: String,
    pub preferred_channels: i32,
    pub preferred_codec: String,
}

impl TrackCriteria {
    pub fn new(mime_glob: &str) -> TrackCriteria {
        TrackCriteria {
            mime_glob: String::from(mime_glob),
            prefer_trick: false,
            preferred_lang: String::new(),
            preferred_channels: 0,
            preferred_codec: String::new(),
        }
    }
}

/// Ranking tuple for adaptation-set selection; larger wins, ties keep document order.
fn rank_adaptation_set(set: &AdaptationSet, criteria: &TrackCriteria) -> (i32, i32, i32, i32) {
    let first = set.representations.first();
    let lang = first.map(|r| r.format.language.as_str()).unwrap_or("");
    let channels = first.map(|r| r.format.audio_channels).unwrap_or(2);
    let codecs = first.map(|r| r.format.codecs.as_str()).unwrap_or("");

    let trick_val = if criteria.prefer_trick { set.is_trick() } else { !set.is_trick() } as i32;
    let lang_val = if !criteria.preferred_lang.is_empty() {
        (lang == criteria.preferred_lang) as i32
    } else {
        0
    };
    let channels_val = if criteria.preferred_channels > 0 {
        if channels >= criteria.preferred_channels {
            channels
        } else {
            0
        }
    } else {
        0
    };
    let codec_val = if !criteria.preferred_codec.is_empty() {
        (codecs == criteria.preferred_codec) as i32
    } else {
        0
    };
    (trick_val, lang_val, channels_val, codec_val)
}

/// Per-representation state: the manifest description plus everything learned from
/// initialization chunks, and the segment-number shift accumulated across live refreshes.
/// All segment numbers accepted and returned by this type are in the external (shifted)
/// numbering.
pub struct RepresentationHolder {
    period_start_time_us: i64,
    period_duration_us: i64,
    pub representation: Representation,
    pub demuxer: DemuxerHandle,
    pub media_format: Option<MediaFormat>,
    given_index: Option<SegmentIndexRef>,
    segment_num_shift: i32,
}

impl RepresentationHolder {
    pub fn new(
        period_start_time_us: i64,
        period_duration_us: i64,
        representation: Representation,
        demuxer: DemuxerHandle,
    ) -> RepresentationHolder {
        RepresentationHolder {
            period_start_time_us,
            period_duration_us,
            representation,
            demuxer,
            media_format: None,
            given_index: None,
            segment_num_shift: 0,
        }
    }

    pub fn segment_num_shift(&self) -> i32 {
        self.segment_num_shift
    }

    /// The index currently answering segment queries: one given from an index chunk wins over
    /// the manifest's.
    pub fn segment_index(&self) -> Option<&SegmentIndexRef> {
        self.given_index.as_ref().or_else(|| self.representation.index())
    }

    pub fn give_media_format(&mut self, media_format: MediaFormat) {
        self.media_format = Some(media_format);
    }

    pub fn give_segment_index(&mut self, index: SegmentIndexRef) {
        self.given_index = Some(index);
    }

    /// Replaces the representation after a manifest refresh, reconciling the new segment index
    /// against the old one. When both indexes are explicit the shift absorbs renumbering; a gap
    /// between old and new means playback fell behind the live window.
    pub fn update_representation(
        &mut self,
        new_period_duration_us: i64,
        new_representation: &Representation,
    ) -> Result<(), DashError> {
        let old_index = self.representation.index().cloned();
        let new_index = new_representation.index().cloned();
        self.period_duration_us = new_period_duration_us;
        self.representation = new_representation.clone();

        let Some(old_index) = old_index else {
            // Segment numbers cannot shift if the index isn't defined by the manifest.
            return Ok(());
        };
        if !old_index.is_explicit() {
            // Segment numbers cannot shift if the index isn't explicit.
            return Ok(());
        }
        let Some(new_index) = new_index else {
            return Ok(());
        };

        let old_last = old_index.last_segment_num(self.period_duration_us);
        let old_end_time_us = old_index.time_us(old_last)
            + old_index.duration_us(old_last, self.period_duration_us);
        let new_first = new_index.first_segment_num();
        let new_start_time_us = new_index.time_us(new_first);

        if old_end_time_us == new_start_time_us {
            // The new index continues where the old one ended, with no overlap.
            self.segment_num_shift += old_last - new_first + 1;
            Ok(())
        } else if old_end_time_us < new_start_time_us {
            // A gap between the old index and the new one: we've slipped behind the live
            // window and can't proceed.
            Err(DashError::BehindLiveWindow)
        } else {
            // The new index overlaps with the old one.
            self.segment_num_shift +=
                old_index.segment_num(new_start_time_us, self.period_duration_us) - new_first;
            Ok(())
        }
    }

    pub fn segment_num(&self, position_us: i64) -> Option<i32> {
        self.segment_index().map(|index| {
            index.segment_num(position_us - self.period_start_time_us, self.period_duration_us)
                + self.segment_num_shift
        })
    }

    pub fn segment_start_time_us(&self, segment_num: i32) -> Option<i64> {
        self.segment_index()
            .map(|index| index.time_us(segment_num - self.segment_num_shift) + self.period_start_time_us)
    }

    pub fn segment_end_time_us(&self, segment_num: i32) -> Option<i64> {
        let index = self.segment_index()?;
        let start = self.segment_start_time_us(segment_num)?;
        Some(
            start
                + index.duration_us(segment_num - self.segment_num_shift, self.period_duration_us),
        )
    }

    pub fn first_segment_num(&self) -> Option<i32> {
        self.segment_index().map(|index| index.first_segment_num() + self.segment_num_shift)
    }

    /// The earliest segment that can be fetched right now.
    pub fn first_available_segment_num(&self) -> Option<i32> {
        self.first_segment_num()
    }

    pub fn last_segment_num(&self) -> Option<i32> {
        self.segment_index().map(|index| {
            let last = index.last_segment_num(self.period_duration_us);
            if last == INDEX_UNBOUNDED {
                INDEX_UNBOUNDED
            } else {
                last + self.segment_num_shift
            }
        })
    }

    pub fn is_beyond_last_segment(&self, segment_num: i32) -> bool {
        match self.last_segment_num() {
            None | Some(INDEX_UNBOUNDED) => false,
            Some(last) => segment_num > last,
        }
    }

    pub fn is_before_first_segment(&self, segment_num: i32) -> bool {
        match self.first_segment_num() {
            None => false,
            Some(first) => segment_num < first,
        }
    }

    pub fn segment_uri(&self, segment_num: i32) -> Option<RangedUri> {
        self.segment_index()
            .map(|index| index.segment_url(segment_num - self.segment_num_shift))
    }
}

/// One manifest period as seen by one track: the selected adaptation set, its representation
/// holders, aggregated DRM init data and the derived availability window.
pub struct PeriodHolder {
    pub local_index: i32,
    pub start_time_us: i64,
    pub period_duration_us: i64,
    representation_holders: HashMap<String, RepresentationHolder>,
    /// Indices into the selected adaptation set's representation list, in document order.
    /// A refresh can add/remove segments but never changes the representations of a period.
    representation_indices: Vec<usize>,
    /// Format ids in document order, for deterministic candidate listings.
    format_ids: Vec<String>,
    pub drm_init_data: Option<Arc<DrmInitData>>,
    pub index_is_unbounded: bool,
    pub index_is_explicit: bool,
    pub available_start_time_us: i64,
    /// `None` while the last segment of an unbounded live index is unknown.
    pub available_end_time_us: Option<i64>,
}

impl PeriodHolder {
    pub fn new(
        local_index: i32,
        manifest: &MediaPresentation,
        manifest_index: usize,
        criteria: &TrackCriteria,
        playback_rate: PlaybackRate,
        demuxer_factory: &dyn DemuxerFactory,
    ) -> PeriodHolder {
        let period = manifest.period(manifest_index);
        let start_time_us = period.start_ms * 1_000;
        let period_duration_us = period_duration_us(manifest, manifest_index);
        let mut holder = PeriodHolder {
            local_index,
            start_time_us,
            period_duration_us,
            representation_holders: HashMap::new(),
            representation_indices: Vec::new(),
            format_ids: Vec::new(),
            drm_init_data: None,
            index_is_unbounded: false,
            index_is_explicit: true,
            available_start_time_us: start_time_us,
            available_end_time_us: None,
        };

        let Some(adaptation_set) = select_adaptation_set(period.adaptation_sets.as_slice(), criteria)
        else {
            // No adaptation set matches the criteria. This period will never produce a chunk
            // but still needs proper boundaries.
            holder.update_representation_independent_properties(None);
            return holder;
        };

        holder.drm_init_data = build_drm_init_data(adaptation_set);

        for (index, representation) in adaptation_set.representations.iter().enumerate() {
            holder.representation_indices.push(index);
            holder.format_ids.push(representation.format.id.clone());
            let demuxer = create_demuxer(
                adaptation_set.set_type,
                representation,
                start_time_us,
                period_duration_us,
                playback_rate,
                demuxer_factory,
            );
            holder.representation_holders.insert(
                representation.format.id.clone(),
                RepresentationHolder::new(
                    start_time_us,
                    period_duration_us,
                    representation.clone(),
                    demuxer,
                ),
            );
        }
        let first_index = holder
            .representation_indices
            .first()
            .and_then(|&i| adaptation_set.representations[i].index().cloned());
        holder.update_representation_independent_properties(first_index.as_ref());
        holder
    }

    /// Re-selects the adaptation set against a refreshed manifest and updates each
    /// representation holder with the matching new representation.
    pub fn update_period(
        &mut self,
        manifest: &MediaPresentation,
        manifest_index: usize,
        criteria: &TrackCriteria,
    ) -> Result<(), DashError> {
        let period = manifest.period(manifest_index);
        let period_duration_us = period_duration_us(manifest, manifest_index);
        let Some(adaptation_set) = select_adaptation_set(period.adaptation_sets.as_slice(), criteria)
        else {
            error!("No adaptation set found for track criteria on refresh");
            return Err(DashError::Parsing(String::from(
                "refreshed period lost its matching adaptation set",
            )));
        };

        self.period_duration_us = period_duration_us;
        for &index in &self.representation_indices {
            let representation = &adaptation_set.representations[index];
            let holder = self
                .representation_holders
                .get_mut(&representation.format.id)
                .ok_or_else(|| {
                    warn!("Missing format id {} on refresh", representation.format.id);
                    DashError::Parsing(String::from("representation disappeared on refresh"))
                })?;
            holder.update_representation(period_duration_us, representation)?;
        }
        let first_index = self
            .representation_indices
            .first()
            .and_then(|&i| adaptation_set.representations[i].index().cloned());
        self.update_representation_independent_properties(first_index.as_ref());
        Ok(())
    }

    fn update_representation_independent_properties(&mut self, index: Option<&SegmentIndexRef>) {
        match index {
            Some(index) => {
                let first = index.first_segment_num();
                let last = index.last_segment_num(self.period_duration_us);
                self.index_is_unbounded = last == INDEX_UNBOUNDED;
                self.index_is_explicit = index.is_explicit();
                self.available_start_time_us = self.start_time_us + index.time_us(first);
                self.available_end_time_us = if self.index_is_unbounded {
                    None
                } else {
                    Some(
                        self.start_time_us
                            + index.time_us(last)
                            + index.duration_us(last, self.period_duration_us),
                    )
                };
            }
            None => {
                self.index_is_unbounded = false;
                self.index_is_explicit = true;
                self.available_start_time_us = self.start_time_us;
                self.available_end_time_us = if self.period_duration_us == UNKNOWN_DURATION_US {
                    None
                } else {
                    Some(self.start_time_us + self.period_duration_us)
                };
            }
        }
    }

    pub fn representation_holder(&self, format_id: &str) -> Option<&RepresentationHolder> {
        self.representation_holders.get(format_id)
    }

    pub fn representation_holder_mut(&mut self, format_id: &str) -> Option<&mut RepresentationHolder> {
        self.representation_holders.get_mut(format_id)
    }

    pub fn num_representation_holders(&self) -> usize {
        self.representation_holders.len()
    }

    /// Candidate formats of the selected adaptation set, in document order.
    pub fn formats(&self) -> Vec<crate::mpd::Format> {
        self.format_ids
            .iter()
            .filter_map(|id| self.representation_holders.get(id))
            .map(|h| h.representation.format.clone())
            .collect()
    }

    /// Any representation's segment index; used for seek adjustment, where all representations
    /// of a set are assumed segment-aligned.
    pub fn arbitrary_segment_index(&self) -> Option<SegmentIndexRef> {
        self.format_ids
            .iter()
            .filter_map(|id| self.representation_holders.get(id))
            .find_map(|h| h.segment_index().cloned())
    }

    pub fn set_drm_init_data(&mut self, drm_init_data: Arc<DrmInitData>) {
        self.drm_init_data = Some(drm_init_data);
    }
}

fn period_duration_us(manifest: &MediaPresentation, manifest_index: usize) -> i64 {
    let ms = manifest.period_duration_ms(manifest_index);
    if ms < 0 {
        UNKNOWN_DURATION_US
    } else {
        ms * 1_000
    }
}

/// Picks the adaptation set for the track: hard-filter on the mime glob, then rank by the
/// criteria preferences. Among equals, the first in document order wins.
pub fn select_adaptation_set<'a>(
    sets: &'a [AdaptationSet],
    criteria: &TrackCriteria,
) -> Option<&'a AdaptationSet> {
    let mut best: Option<(&AdaptationSet, (i32, i32, i32, i32))> = None;
    for set in sets {
        let Some(first) = set.representations.first() else {
            continue;
        };
        if !mime_type_matches(&criteria.mime_glob, &first.format.mime_type) {
            continue;
        }
        let rank = rank_adaptation_set(set, criteria);
        if best.as_ref().is_none_or(|(_, b)| rank > *b) {
            best = Some((set, rank));
        }
    }
    best.map(|(set, _)| set)
}

/// Aggregates content-protection descriptors carrying a known UUID and init data into mapped
/// DRM init data.
fn build_drm_init_data(adaptation_set: &AdaptationSet) -> Option<Arc<DrmInitData>> {
    if !adaptation_set.has_content_protections() {
        return None;
    }
    let mut mapped = HashMap::new();
    for protection in &adaptation_set.content_protections {
        if let (Some(uuid), Some(data)) = (&protection.uuid, &protection.scheme_init_data) {
            mapped.insert(*uuid, data.clone());
        }
    }
    if mapped.is_empty() {
        None
    } else {
        Some(Arc::new(DrmInitData::Mapped(mapped)))
    }
}

fn create_demuxer(
    set_type: AdaptationType,
    representation: &Representation,
    period_start_time_us: i64,
    period_duration_us: i64,
    playback_rate: PlaybackRate,
    factory: &dyn DemuxerFactory,
) -> DemuxerHandle {
    match set_type {
        AdaptationType::Video => {
            demuxer_handle(factory.create_fmp4(&[], !playback_rate.is_forward()))
        }
        AdaptationType::Audio => demuxer_handle(factory.create_fmp4(
            &[AUDIO_OBJECT_TYPE_AAC, AUDIO_OBJECT_TYPE_AC3, AUDIO_OBJECT_TYPE_EAC3],
            !playback_rate.is_forward(),
        )),
        AdaptationType::Text => {
            // A caption stream may arrive as one un-indexed file spanning the entire asset,
            // repeated for every period. Constrain parsing to the period's window so the
            // sample queue only ever sees what a properly chunked server would have sent.
            let truncate_window = match &representation.segment_base {
                crate::mpd::SegmentBase::Single(single)
                    if single.initialization.is_none()
                        && representation.format.mime_type == MIME_RAWCC
                        && representation.index_uri().is_none() =>
                {
                    let start = representation.presentation_time_offset_us;
                    if period_duration_us == UNKNOWN_DURATION_US {
                        None
                    } else {
                        debug!(
                            "Truncating single-file un-indexed rawcc stream to [{start}, {})",
                            start + period_duration_us
                        );
                        Some((start, start + period_duration_us))
                    }
                }
                _ => None,
            };
            let sample_offset_us =
                period_start_time_us - representation.presentation_time_offset_us;
            demuxer_handle(factory.create_rawcc(sample_offset_us, truncate_window))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::{DemuxResult, DemuxerInput, SegmentDemuxer, TrackOutput};
    use crate::mpd::{
        Format, MultiSegmentIndex, SegmentUrlSource, TimelineElement, UrlTemplate,
    };

    struct NullDemuxer;

    impl SegmentDemuxer for NullDemuxer {
        fn init(&mut self) {}
        fn read(&mut self, _: &mut DemuxerInput<'_>, _: &mut dyn TrackOutput) -> DemuxResult {
            DemuxResult::EndOfInput
        }
    }

    pub(crate) struct NullDemuxerFactory;

    impl DemuxerFactory for NullDemuxerFactory {
        fn create_fmp4(&self, _: &[i32], _: bool) -> Box<dyn SegmentDemuxer> {
            Box::new(NullDemuxer)
        }
        fn create_rawcc(&self, _: i64, _: Option<(i64, i64)>) -> Box<dyn SegmentDemuxer> {
            Box::new(NullDemuxer)
        }
    }

    const US: i64 = 1_000_000;

    /// Six 2.5s segments, numbered from zero, whose timeline starts at `window_start`
    /// (timescale 1000). Models a live window that slides across refreshes.
    fn windowed_representation(window_start_ms: u64) -> Representation {
        let timeline: Vec<TimelineElement> = (0..6)
            .map(|i| TimelineElement { start: window_start_ms + i * 2_500, duration: 2_500 })
            .collect();
        let index = MultiSegmentIndex {
            base_uri: Arc::from("http://media/"),
            initialization: None,
            timescale: 1_000,
            presentation_time_offset: 0,
            start_number: 0,
            duration: 2_500,
            timeline: Some(Arc::new(timeline)),
            source: SegmentUrlSource::Template(UrlTemplate::new(
                "segment/$RepresentationID$/$Number$/",
            )),
            format_id: String::from("1"),
            bandwidth: 200_000,
        };
        Representation::new(
            "content_id",
            98,
            Format::new("1", "video/mp4", 200_000),
            crate::mpd::SegmentBase::Multi(Arc::new(index)),
            false,
        )
    }

    fn holder(representation: Representation, period_duration_us: i64) -> RepresentationHolder {
        RepresentationHolder::new(
            0,
            period_duration_us,
            representation,
            demuxer_handle(Box::new(NullDemuxer)),
        )
    }

    #[test]
    fn live_window_slide_without_gap_accumulates_shift() {
        let mut rh = holder(windowed_representation(0), 15 * US);
        // Refresh: the window now covers 15..30s, renumbered from zero.
        let updated = windowed_representation(15_000);
        rh.update_representation(30 * US, &updated).unwrap();
        assert_eq!(rh.segment_num_shift(), 6);
        assert_eq!(rh.first_segment_num(), Some(6));
        assert_eq!(rh.first_available_segment_num(), Some(6));
        assert_eq!(rh.last_segment_num(), Some(11));

        // Overlapping refresh: window covers 22.5..37.5s (segments 9..14).
        let updated = windowed_representation(22_500);
        rh.update_representation(37_500 * 1_000, &updated).unwrap();
        assert_eq!(rh.first_segment_num(), Some(9));
        assert_eq!(rh.last_segment_num(), Some(14));
    }

    #[test]
    fn live_window_slide_with_gap_fails() {
        let mut rh = holder(windowed_representation(0), 15 * US);
        // Window jumps to 40..55s: segment 15 was missed entirely.
        let updated = windowed_representation(40_000);
        let err = rh.update_representation(52_500 * 1_000, &updated).unwrap_err();
        assert!(matches!(err, DashError::BehindLiveWindow));
    }

    #[test]
    fn shift_preserves_segment_time_mapping() {
        let mut rh = holder(windowed_representation(0), 15 * US);
        rh.update_representation(30 * US, &windowed_representation(15_000)).unwrap();
        // External segment 6 is the first of the new window, starting at 15s.
        assert_eq!(rh.segment_start_time_us(6), Some(15 * US));
        assert_eq!(rh.segment_end_time_us(6), Some(17_500 * 1_000));
        assert_eq!(rh.segment_num(16 * US), Some(6));
        assert!(rh.is_beyond_last_segment(12));
        assert!(!rh.is_beyond_last_segment(11));
        assert!(rh.is_before_first_segment(5));
        let uri = rh.segment_uri(6).unwrap();
        assert_eq!(uri.uri_string(), "http://media/segment/1/0/");
    }

    #[test]
    fn segment_queries_without_shift() {
        let rh = holder(windowed_representation(0), 15 * US);
        assert_eq!(rh.segment_num(0), Some(0));
        assert_eq!(rh.segment_num(2_500 * 1_000), Some(1));
        assert_eq!(rh.segment_start_time_us(1), Some(2_500 * 1_000));
        assert_eq!(rh.segment_end_time_us(1), Some(5 * US));
        assert!(rh.is_beyond_last_segment(6));
        assert!(!rh.is_beyond_last_segment(5));
        assert!(rh.is_before_first_segment(-1));
        assert_eq!(
            rh.segment_uri(1).unwrap().uri_string(),
            "http://media/segment/1/1/"
        );
    }

    fn video_set(id: &str, trick: bool, lang: &str, channels: i32, codec: &str) -> AdaptationSet {
        let mut format = Format::new(id, "video/mp4", 1_000_000);
        format.language = String::from(lang);
        format.audio_channels = channels;
        format.codecs = String::from(codec);
        let representation = Representation::new(
            "c",
            0,
            format,
            crate::mpd::SegmentBase::Multi(Arc::new(MultiSegmentIndex {
                base_uri: Arc::from("http://media/"),
                initialization: None,
                timescale: 1,
                presentation_time_offset: 0,
                start_number: 0,
                duration: 10,
                timeline: None,
                source: SegmentUrlSource::Template(UrlTemplate::new("$Number$.m4s")),
                format_id: String::from(id),
                bandwidth: 1_000_000,
            })),
            false,
        );
        AdaptationSet {
            id: String::from(id),
            set_type: AdaptationType::Video,
            representations: vec![representation],
            content_protections: vec![],
            supplemental_properties: if trick {
                vec![crate::mpd::Descriptor {
                    scheme_id_uri: String::from(crate::mpd::TRICK_PLAY_SCHEME),
                    value: String::new(),
                }]
            } else {
                vec![]
            },
            essential_properties: vec![],
        }
    }

    #[test]
    fn selection_prefers_matching_trick_bit() {
        let sets = vec![
            video_set("normal", false, "", 0, ""),
            video_set("trick", true, "", 0, ""),
        ];
        let mut criteria = TrackCriteria::new("video/*");
        let picked = select_adaptation_set(&sets, &criteria).unwrap();
        assert_eq!(picked.id, "normal");
        criteria.prefer_trick = true;
        let picked = select_adaptation_set(&sets, &criteria).unwrap();
        assert_eq!(picked.id, "trick");
    }

    #[test]
    fn selection_breaks_lang_and_channel_ties_in_document_order() {
        let sets = vec![
            video_set("en-stereo", false, "en", 2, "avc1"),
            video_set("fr-51", false, "fr", 6, "avc1"),
            video_set("en-51", false, "en", 6, "avc1"),
        ];
        let mut criteria = TrackCriteria::new("video/*");
        criteria.preferred_lang = String::from("en");
        assert_eq!(select_adaptation_set(&sets, &criteria).unwrap().id, "en-stereo");
        criteria.preferred_lang = String::new();
        criteria.preferred_channels = 4;
        assert_eq!(select_adaptation_set(&sets, &criteria).unwrap().id, "fr-51");
        // Empty criteria: first in document order.
        let criteria = TrackCriteria::new("video/*");
        assert_eq!(select_adaptation_set(&sets, &criteria).unwrap().id, "en-stereo");
    }

    #[test]
    fn selection_hard_filters_on_mime() {
        let sets = vec![video_set("v", false, "", 0, "")];
        let criteria = TrackCriteria::new("audio/*");
        assert!(select_adaptation_set(&sets, &criteria).is_none());
    }

    #[test]
    fn period_holder_derives_availability_and_drm() {
        use crate::drm::{SchemeInitData, WIDEVINE_UUID};
        use crate::mpd::{ContentProtection, MediaPresentation, Period};

        let mut set = video_set("v", false, "", 0, "avc1");
        set.content_protections.push(ContentProtection {
            scheme_id_uri: String::from("urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed"),
            uuid: Some(WIDEVINE_UUID),
            scheme_init_data: Some(SchemeInitData::new(
                "video/mp4",
                bytes::Bytes::from_static(b"pssh"),
            )),
        });
        let manifest = MediaPresentation {
            availability_start_time_ms: 0,
            duration_ms: 40_000,
            min_buffer_time_ms: 0,
            dynamic: false,
            min_update_period_ms: -1,
            time_shift_buffer_depth_ms: -1,
            location: None,
            periods: vec![Period {
                id: String::from("p0"),
                start_ms: 0,
                adaptation_sets: vec![set],
            }],
        };

        let holder = PeriodHolder::new(
            0,
            &manifest,
            0,
            &TrackCriteria::new("video/*"),
            PlaybackRate::default(),
            &NullDemuxerFactory,
        );
        assert_eq!(holder.num_representation_holders(), 1);
        assert_eq!(holder.available_start_time_us, 0);
        // Fixed-duration template (10s segments over a 40s period).
        assert_eq!(holder.available_end_time_us, Some(40 * US));
        assert!(!holder.index_is_unbounded);
        let drm = holder.drm_init_data.as_ref().expect("aggregated drm init data");
        assert!(drm.get(&WIDEVINE_UUID).is_some());
        assert!(holder.arbitrary_segment_index().is_some());
    }
}
