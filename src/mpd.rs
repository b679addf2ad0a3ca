//! The manifest model: an immutable snapshot of an MPD together with the per-representation
//! segment index queries the chunk source runs against it.
//!
//! A [`MediaPresentation`] is built once (by [`crate::xml`] or by hand in tests), published behind
//! an `Arc`, and replaced wholesale on refresh. Nothing in here is mutated after construction.

use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::demux::ChunkIndex;
use crate::drm::SchemeInitData;
use crate::DURATION_UNKNOWN_MS;

/// Scheme URI carried as a supplemental property on adaptation sets holding trick-play
/// (low frame rate, high speed) encodes.
pub const TRICK_PLAY_SCHEME: &str = "http://dashif.org/guidelines/trickmode";

/// Returned by [`DashSegmentIndex::last_segment_num`] when the last segment is not yet known
/// (unbounded live template).
pub const INDEX_UNBOUNDED: i32 = -1;

/// Period duration value passed to index queries when the duration is unknown.
pub const UNKNOWN_DURATION_US: i64 = -1;

/// Top-level manifest snapshot.
#[derive(Debug, Clone)]
pub struct MediaPresentation {
    /// Epoch milliseconds at which media time zero became available (dynamic only).
    pub availability_start_time_ms: i64,
    /// Total presentation duration, or [`DURATION_UNKNOWN_MS`].
    pub duration_ms: i64,
    pub min_buffer_time_ms: i64,
    pub dynamic: bool,
    pub min_update_period_ms: i64,
    /// Depth of the live time-shift buffer, or -1 when unset.
    pub time_shift_buffer_depth_ms: i64,
    /// URI from which the next manifest refresh should be fetched, when the manifest supplies one.
    pub location: Option<String>,
    /// Periods in non-decreasing, non-overlapping start order.
    pub periods: Vec<Period>,
}

impl MediaPresentation {
    pub fn period(&self, index: usize) -> &Period {
        &self.periods[index]
    }

    pub fn period_count(&self) -> usize {
        self.periods.len()
    }

    /// Duration of period `index` in milliseconds: the gap to the next period's start, or the
    /// remainder of the presentation for the last period. [`DURATION_UNKNOWN_MS`] when the
    /// presentation duration itself is unknown.
    pub fn period_duration_ms(&self, index: usize) -> i64 {
        if index + 1 < self.periods.len() {
            self.periods[index + 1].start_ms - self.periods[index].start_ms
        } else if self.duration_ms == DURATION_UNKNOWN_MS {
            DURATION_UNKNOWN_MS
        } else {
            self.duration_ms - self.periods[index].start_ms
        }
    }
}

#[derive(Debug, Clone)]
pub struct Period {
    pub id: String,
    pub start_ms: i64,
    pub adaptation_sets: Vec<AdaptationSet>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdaptationType {
    Video,
    Audio,
    Text,
}

impl AdaptationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdaptationType::Video => "video",
            AdaptationType::Audio => "audio",
            AdaptationType::Text => "text",
        }
    }
}

/// A `SupplementalProperty` or `EssentialProperty` descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub scheme_id_uri: String,
    pub value: String,
}

/// A `ContentProtection` descriptor carrying an optional scheme UUID and init data blob.
#[derive(Debug, Clone)]
pub struct ContentProtection {
    pub scheme_id_uri: String,
    pub uuid: Option<Uuid>,
    pub scheme_init_data: Option<SchemeInitData>,
}

#[derive(Debug, Clone)]
pub struct AdaptationSet {
    pub id: String,
    pub set_type: AdaptationType,
    pub representations: Vec<Representation>,
    pub content_protections: Vec<ContentProtection>,
    pub supplemental_properties: Vec<Descriptor>,
    pub essential_properties: Vec<Descriptor>,
}

impl AdaptationSet {
    pub fn has_content_protections(&self) -> bool {
        !self.content_protections.is_empty()
    }

    /// True when a supplemental property tags this set as a trick-play encode.
    pub fn is_trick(&self) -> bool {
        self.supplemental_properties.iter().any(|p| p.scheme_id_uri == TRICK_PLAY_SCHEME)
    }
}

/// Static attributes of one encoding of the content.
#[derive(Debug, Clone, PartialEq)]
pub struct Format {
    pub id: String,
    pub mime_type: String,
    pub codecs: String,
    /// Bits per second, or -1 when unknown.
    pub bitrate: i32,
    pub width: i32,
    pub height: i32,
    pub audio_channels: i32,
    pub audio_sampling_rate: i32,
    pub language: String,
}

impl Format {
    pub fn new(id: &str, mime_type: &str, bitrate: i32) -> Format {
        Format {
            id: String::from(id),
            mime_type: String::from(mime_type),
            codecs: String::new(),
            bitrate,
            width: -1,
            height: -1,
            audio_channels: -1,
            audio_sampling_rate: -1,
            language: String::new(),
        }
    }
}

/// Matches a mime type against a criteria pattern where `*` matches any run of characters
/// (`video/*`, `*`, `application/x-rawcc`).
pub fn mime_type_matches(pattern: &str, mime_type: &str) -> bool {
    fn matches(p: &[u8], s: &[u8]) -> bool {
        match (p.first(), s.first()) {
            (None, None) => true,
            (Some(b'*'), _) => matches(&p[1..], s) || (!s.is_empty() && matches(p, &s[1..])),
            (Some(c), Some(d)) if c == d => matches(&p[1..], &s[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), mime_type.as_bytes())
}

/// A byte range located at a URI. Manifests commonly express many ranges against one resource;
/// the base URI is shared so that each instance stays small.
#[derive(Debug, Clone, PartialEq)]
pub struct RangedUri {
    pub base_uri: Arc<str>,
    pub reference_uri: String,
    /// Zero-based index of the first byte of the range.
    pub start: i64,
    /// Length of the range, or -1 when the range extends to the end of the resource.
    pub length: i64,
}

impl RangedUri {
    pub fn new(base_uri: &Arc<str>, reference_uri: &str, start: i64, length: i64) -> RangedUri {
        RangedUri {
            base_uri: Arc::clone(base_uri),
            reference_uri: String::from(reference_uri),
            start,
            length,
        }
    }

    /// The resolved URI as a string.
    pub fn uri_string(&self) -> String {
        if self.reference_uri.is_empty() {
            return String::from(&*self.base_uri);
        }
        match Url::parse(&self.base_uri).and_then(|base| base.join(&self.reference_uri)) {
            Ok(u) => u.to_string(),
            // Not an absolute base; fall back to naive concatenation.
            Err(_) => format!("{}{}", self.base_uri, self.reference_uri),
        }
    }

    /// Merges this range with `other` if both address the same resource and `other` starts at
    /// the byte after this range ends (contiguous, no overlap).
    pub fn attempt_merge(&self, other: &RangedUri) -> Option<RangedUri> {
        if self.length == -1
            || !Arc::ptr_eq(&self.base_uri, &other.base_uri) && self.base_uri != other.base_uri
            || self.reference_uri != other.reference_uri
            || self.start + self.length != other.start
        {
            return None;
        }
        Some(RangedUri {
            base_uri: Arc::clone(&self.base_uri),
            reference_uri: self.reference_uri.clone(),
            start: self.start,
            length: if other.length == -1 { -1 } else { self.length + other.length },
        })
    }
}

/// Indexes the segments within a representation.
pub trait DashSegmentIndex: Send + Sync {
    /// Segment number of the first segment.
    fn first_segment_num(&self) -> i32;

    /// Segment number of the last segment, or [`INDEX_UNBOUNDED`] when not yet known.
    fn last_segment_num(&self, period_duration_us: i64) -> i32;

    /// Segment number of the segment containing `time_us`, clamped to
    /// `[first_segment_num, last_segment_num]`.
    fn segment_num(&self, time_us: i64, period_duration_us: i64) -> i32;

    /// Start time of a segment within the period.
    fn time_us(&self, segment_num: i32) -> i64;

    /// Duration of a segment. `period_duration_us` bounds the final segment of fixed-duration
    /// templates.
    fn duration_us(&self, segment_num: i32, period_duration_us: i64) -> i64;

    /// Location of a segment.
    fn segment_url(&self, segment_num: i32) -> RangedUri;

    /// True iff every segment listed by the index is guaranteed to be currently available.
    fn is_explicit(&self) -> bool;
}

/// Shared handle to a segment index.
pub type SegmentIndexRef = Arc<dyn DashSegmentIndex>;

/// One element of a segment timeline, in timescale units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineElement {
    pub start: u64,
    pub duration: u64,
}

/// URL template supporting the `$RepresentationID$`, `$Number$`, `$Bandwidth$` and `$Time$`
/// identifiers with optional `%0[width]d` zero-padding and the `$$` escape, per DASH-IF IOP
/// (no other printf conversions are permitted, so a single pattern covers the grammar).
#[derive(Debug, Clone, PartialEq)]
pub struct UrlTemplate {
    template: String,
}

lazy_static! {
    static ref TEMPLATE_IDENTIFIER: Regex =
        Regex::new(r"\$(RepresentationID|Number|Time|Bandwidth|)(?:%0(\d+)d)?\$").unwrap();
}

impl UrlTemplate {
    pub fn new(template: &str) -> UrlTemplate {
        UrlTemplate { template: String::from(template) }
    }

    pub fn resolve(&self, representation_id: &str, number: i64, bandwidth: i32, time: u64) -> String {
        TEMPLATE_IDENTIFIER
            .replace_all(&self.template, |caps: &regex::Captures<'_>| {
                let value = match &caps[1] {
                    "RepresentationID" => return String::from(representation_id),
                    "Number" => number.to_string(),
                    "Time" => time.to_string(),
                    "Bandwidth" => bandwidth.to_string(),
                    // An empty identifier is the `$$` escape for a literal dollar sign.
                    _ => return String::from("$"),
                };
                match caps.get(2).and_then(|w| w.as_str().parse::<usize>().ok()) {
                    Some(width) if width > value.len() => {
                        let mut padded = "0".repeat(width - value.len());
                        padded.push_str(&value);
                        padded
                    }
                    _ => value,
                }
            })
            .into_owned()
    }
}

/// How a multi-segment representation names its media segments.
#[derive(Debug, Clone)]
pub enum SegmentUrlSource {
    /// Explicit `SegmentList` of per-segment URIs, indexed from `start_number`.
    List(Arc<Vec<RangedUri>>),
    /// `SegmentTemplate` media pattern resolved per segment number.
    Template(UrlTemplate),
}

/// Segment index backed by a `SegmentList` or `SegmentTemplate`, with or without a timeline.
/// Instantiated once per representation; the timeline and URL list are shared across the
/// representations of an adaptation set.
#[derive(Debug, Clone)]
pub struct MultiSegmentIndex {
    pub base_uri: Arc<str>,
    pub initialization: Option<RangedUri>,
    pub timescale: u64,
    /// Presentation time offset in timescale units.
    pub presentation_time_offset: u64,
    pub start_number: i32,
    /// Fixed segment duration in timescale units; unused when a timeline is present.
    pub duration: u64,
    pub timeline: Option<Arc<Vec<TimelineElement>>>,
    pub source: SegmentUrlSource,
    /// Identity of the owning representation, substituted into templates.
    pub format_id: String,
    pub bandwidth: i32,
}

impl MultiSegmentIndex {
    fn units_to_us(&self, units: u64) -> i64 {
        (units as i64).saturating_mul(1_000_000) / self.timescale.max(1) as i64
    }

    pub fn presentation_time_offset_us(&self) -> i64 {
        self.units_to_us(self.presentation_time_offset)
    }

    pub fn initialization_uri(&self) -> Option<RangedUri> {
        self.initialization.clone()
    }

    /// Start time of a segment in timescale units, before the presentation time offset is
    /// subtracted. This is the value substituted for `$Time$`.
    fn segment_time_units(&self, segment_num: i32) -> u64 {
        let rel = (segment_num - self.start_number) as u64;
        match &self.timeline {
            Some(tl) => tl[rel as usize].start,
            None => rel * self.duration + self.presentation_time_offset,
        }
    }
}

impl DashSegmentIndex for MultiSegmentIndex {
    fn first_segment_num(&self) -> i32 {
        self.start_number
    }

    fn last_segment_num(&self, period_duration_us: i64) -> i32 {
        match &self.timeline {
            Some(tl) => self.start_number + tl.len() as i32 - 1,
            None => {
                if period_duration_us == UNKNOWN_DURATION_US {
                    INDEX_UNBOUNDED
                } else {
                    let duration_us = self.units_to_us(self.duration).max(1);
                    let count = (period_duration_us + duration_us - 1) / duration_us;
                    self.start_number + (count as i32).max(1) - 1
                }
            }
        }
    }

    fn segment_num(&self, time_us: i64, period_duration_us: i64) -> i32 {
        let first = self.first_segment_num();
        match &self.timeline {
            Some(tl) => {
                // Last element whose start is <= time_us.
                let pto = self.presentation_time_offset;
                let mut num = first;
                for (i, el) in tl.iter().enumerate() {
                    let start_us = self.units_to_us(el.start) - self.units_to_us(pto);
                    if start_us <= time_us {
                        num = first + i as i32;
                    } else {
                        break;
                    }
                }
                num
            }
            None => {
                let duration_us = self.units_to_us(self.duration).max(1);
                let unclamped = first + (time_us.max(0) / duration_us) as i32;
                let last = self.last_segment_num(period_duration_us);
                if last == INDEX_UNBOUNDED {
                    unclamped.max(first)
                } else {
                    unclamped.clamp(first, last)
                }
            }
        }
    }

    fn time_us(&self, segment_num: i32) -> i64 {
        let rel = (segment_num - self.start_number) as u64;
        match &self.timeline {
            Some(tl) => {
                self.units_to_us(tl[rel as usize].start)
                    - self.units_to_us(self.presentation_time_offset)
            }
            None => self.units_to_us(rel * self.duration),
        }
    }

    fn duration_us(&self, segment_num: i32, period_duration_us: i64) -> i64 {
        match &self.timeline {
            Some(tl) => {
                let rel = (segment_num - self.start_number) as usize;
                self.units_to_us(tl[rel].duration)
            }
            None => {
                let last = self.last_segment_num(period_duration_us);
                if last != INDEX_UNBOUNDED && segment_num == last {
                    period_duration_us - self.time_us(segment_num)
                } else {
                    self.units_to_us(self.duration)
                }
            }
        }
    }

    fn segment_url(&self, segment_num: i32) -> RangedUri {
        match &self.source {
            SegmentUrlSource::List(urls) => urls[(segment_num - self.start_number) as usize].clone(),
            SegmentUrlSource::Template(template) => {
                let reference = template.resolve(
                    &self.format_id,
                    segment_num as i64,
                    self.bandwidth,
                    self.segment_time_units(segment_num),
                );
                RangedUri::new(&self.base_uri, &reference, 0, -1)
            }
        }
    }

    fn is_explicit(&self) -> bool {
        self.timeline.is_some() || matches!(self.source, SegmentUrlSource::List(_))
    }
}

/// Index for a representation consisting of exactly one segment.
#[derive(Debug, Clone)]
pub struct SingleSegmentIndex {
    uri: RangedUri,
}

impl SingleSegmentIndex {
    pub fn new(uri: RangedUri) -> SingleSegmentIndex {
        SingleSegmentIndex { uri }
    }
}

impl DashSegmentIndex for SingleSegmentIndex {
    fn first_segment_num(&self) -> i32 {
        0
    }

    fn last_segment_num(&self, _period_duration_us: i64) -> i32 {
        0
    }

    fn segment_num(&self, _time_us: i64, _period_duration_us: i64) -> i32 {
        0
    }

    fn time_us(&self, _segment_num: i32) -> i64 {
        0
    }

    fn duration_us(&self, _segment_num: i32, period_duration_us: i64) -> i64 {
        period_duration_us
    }

    fn segment_url(&self, _segment_num: i32) -> RangedUri {
        self.uri.clone()
    }

    fn is_explicit(&self) -> bool {
        true
    }
}

/// Index built from a [`ChunkIndex`] sidecar parsed out of an initialization chunk, used when
/// the manifest itself does not carry one.
pub struct WrappingSegmentIndex {
    chunk_index: ChunkIndex,
    uri: Arc<str>,
}

impl WrappingSegmentIndex {
    pub fn new(chunk_index: ChunkIndex, uri: &str) -> WrappingSegmentIndex {
        WrappingSegmentIndex { chunk_index, uri: Arc::from(uri) }
    }
}

impl DashSegmentIndex for WrappingSegmentIndex {
    fn first_segment_num(&self) -> i32 {
        0
    }

    fn last_segment_num(&self, _period_duration_us: i64) -> i32 {
        self.chunk_index.len() as i32 - 1
    }

    fn segment_num(&self, time_us: i64, _period_duration_us: i64) -> i32 {
        self.chunk_index.chunk_index(time_us)
    }

    fn time_us(&self, segment_num: i32) -> i64 {
        self.chunk_index.times_us[segment_num as usize]
    }

    fn duration_us(&self, segment_num: i32, _period_duration_us: i64) -> i64 {
        self.chunk_index.durations_us[segment_num as usize]
    }

    fn segment_url(&self, segment_num: i32) -> RangedUri {
        let n = segment_num as usize;
        RangedUri::new(
            &self.uri,
            "",
            self.chunk_index.offsets[n] as i64,
            self.chunk_index.sizes[n] as i64,
        )
    }

    fn is_explicit(&self) -> bool {
        true
    }
}

/// `SegmentBase` for a representation stored as a single media file, addressed by byte ranges.
/// The segment index, if any, has to be fetched from `index_range`.
#[derive(Debug, Clone)]
pub struct SingleSegmentBase {
    pub uri: Arc<str>,
    pub initialization: Option<RangedUri>,
    pub index_range: Option<RangedUri>,
    pub presentation_time_offset_us: i64,
}

/// How a representation describes its segments.
#[derive(Debug, Clone)]
pub enum SegmentBase {
    Single(SingleSegmentBase),
    Multi(Arc<MultiSegmentIndex>),
}

impl SegmentBase {
    pub fn is_single_segment(&self) -> bool {
        matches!(self, SegmentBase::Single(_))
    }
}

/// A single encoding (bitrate, resolution, codec) of the content.
#[derive(Clone)]
pub struct Representation {
    pub format: Format,
    pub segment_base: SegmentBase,
    /// True when the segment base was inherited from the adaptation set or period rather than
    /// declared on the representation itself.
    pub segment_base_inherited: bool,
    pub presentation_time_offset_us: i64,
    /// `content_id "." format.id "." revision_id`, used by data sources for cache addressing.
    pub cache_key: String,
    index: Option<SegmentIndexRef>,
}

impl std::fmt::Debug for Representation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Representation")
            .field("format", &self.format)
            .field("cache_key", &self.cache_key)
            .field("pto_us", &self.presentation_time_offset_us)
            .finish()
    }
}

impl Representation {
    pub fn new(
        content_id: &str,
        revision_id: i64,
        format: Format,
        segment_base: SegmentBase,
        segment_base_inherited: bool,
    ) -> Representation {
        let cache_key = format!("{content_id}.{}.{revision_id}", format.id);
        let (pto_us, index): (i64, Option<SegmentIndexRef>) = match &segment_base {
            SegmentBase::Multi(multi) => {
                (multi.presentation_time_offset_us(), Some(Arc::clone(multi) as SegmentIndexRef))
            }
            SegmentBase::Single(single) => {
                let index = if single.index_range.is_none() {
                    // Unindexed single file: the whole resource is one segment.
                    let uri = RangedUri::new(&single.uri, "", 0, -1);
                    Some(Arc::new(SingleSegmentIndex::new(uri)) as SegmentIndexRef)
                } else {
                    None
                };
                (single.presentation_time_offset_us, index)
            }
        };
        Representation {
            format,
            segment_base,
            segment_base_inherited,
            presentation_time_offset_us: pto_us,
            cache_key,
            index,
        }
    }

    /// The segment index, when the representation provides one directly. `None` when the index
    /// must be fetched from [`Representation::index_uri`].
    pub fn index(&self) -> Option<&SegmentIndexRef> {
        self.index.as_ref()
    }

    /// Location of the representation's initialization data, if any.
    pub fn initialization_uri(&self) -> Option<RangedUri> {
        match &self.segment_base {
            SegmentBase::Single(s) => s.initialization.clone(),
            SegmentBase::Multi(m) => m.initialization_uri(),
        }
    }

    /// Location of the representation's out-of-band segment index, if the manifest does not
    /// provide one directly.
    pub fn index_uri(&self) -> Option<RangedUri> {
        match &self.segment_base {
            SegmentBase::Single(s) => s.index_range.clone(),
            SegmentBase::Multi(_) => None,
        }
    }
}

/// Builds the UUID out of a `urn:uuid:...` scheme id, tolerating the bare form.
pub fn parse_scheme_uuid(scheme_id_uri: &str) -> Option<Uuid> {
    let raw = scheme_id_uri.strip_prefix("urn:uuid:").unwrap_or(scheme_id_uri);
    match Uuid::parse_str(raw) {
        Ok(u) => Some(u),
        Err(_) => {
            if scheme_id_uri.starts_with("urn:uuid:") {
                warn!("Unparseable ContentProtection scheme uuid {scheme_id_uri}");
            }
            None
        }
    }
}
