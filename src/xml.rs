//! serde-based parser for the MPD format, as formally defined in ISO/IEC 23009-1, reduced to
//! the elements the client consumes and converted into the runtime snapshot model.
//!
//! Deserialization goes through quick-xml's serde integration; unknown elements and
//! attributes fall away on their own, so the structs below only model what the client
//! actually reads. Where real-world manifests diverge from the schema, interoperability
//! wins over strictness.

#![allow(non_snake_case)]

use std::sync::Arc;
use std::time::Duration;

use base64::prelude::{Engine, BASE64_STANDARD};
use chrono::DateTime;
use serde::de;
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::drm::SchemeInitData;
use crate::manifest_fetcher::ManifestParser;
use crate::mpd::{
    parse_scheme_uuid, AdaptationSet, AdaptationType, ContentProtection, Descriptor, Format,
    MediaPresentation, MultiSegmentIndex, Period, RangedUri, Representation, SegmentBase,
    SegmentUrlSource, SingleSegmentBase, TimelineElement, UrlTemplate,
};
use crate::{DashError, DURATION_UNKNOWN_MS};

// Parse an xs:duration attribute (ISO 8601, e.g. "PT30S", "PT1.2S", "P1DT2H"), as per
// https://www.w3.org/TR/xmlschema-2/#duration. Calendar units have no exact length in
// seconds; a month is taken as 31 days and a year as 365, which matches how these
// rarely-seen fields get treated in practice.
fn parse_xs_duration(s: &str) -> Result<Duration, DashError> {
    let parsed = iso8601::duration(s)
        .map_err(|e| DashError::Parsing(format!("invalid xs:duration {s}: {e:?}")))?;
    Ok(match parsed {
        iso8601::Duration::Weeks(w) => Duration::from_secs(u64::from(w) * 7 * 86_400),
        iso8601::Duration::YMDHMS { year, month, day, hour, minute, second, millisecond } => {
            let days = u64::from(day) + 31 * u64::from(month) + 365 * u64::from(year);
            let secs =
                u64::from(second) + 60 * (u64::from(minute) + 60 * (u64::from(hour) + 24 * days));
            Duration::from_secs(secs) + Duration::from_millis(u64::from(millisecond))
        }
    })
}

// serde helper for optional xs:duration attributes: an absent attribute is None, a present
// but unparseable one is an error.
fn deserialize_xs_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer).unwrap_or(None);
    raw.map(|s| parse_xs_duration(&s).map_err(de::Error::custom)).transpose()
}

#[derive(Debug, Deserialize, Clone)]
struct BaseURL {
    #[serde(rename = "$text")]
    base: String,
}

#[derive(Debug, Deserialize, Clone)]
struct Initialization {
    #[serde(rename = "@sourceURL")]
    sourceURL: Option<String>,
    #[serde(rename = "@range")]
    range: Option<String>,
}

/// Describes a sequence of contiguous Segments with identical duration.
#[derive(Debug, Deserialize, Clone)]
struct S {
    #[serde(rename = "@t")]
    t: Option<u64>,
    #[serde(rename = "@d")]
    d: u64,
    /// Repeat count (number of contiguous Segments with identical duration minus one).
    #[serde(rename = "@r")]
    r: Option<i64>,
}

#[derive(Debug, Deserialize, Clone)]
struct SegmentTimeline {
    #[serde(rename = "S", default)]
    segments: Vec<S>,
}

#[derive(Debug, Deserialize, Clone)]
struct SegmentTemplate {
    #[serde(rename = "@initialization")]
    initialization: Option<String>,
    #[serde(rename = "@media")]
    media: Option<String>,
    #[serde(rename = "SegmentTimeline")]
    SegmentTimeline: Option<SegmentTimeline>,
    #[serde(rename = "@startNumber")]
    startNumber: Option<u64>,
    // The spec says this is an unsigned int, not an xs:duration.
    #[serde(rename = "@duration")]
    duration: Option<u64>,
    #[serde(rename = "@timescale")]
    timescale: Option<u64>,
    #[serde(rename = "@presentationTimeOffset")]
    presentationTimeOffset: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
struct SegmentURL {
    #[serde(rename = "@media")]
    media: Option<String>,
    #[serde(rename = "@mediaRange")]
    mediaRange: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct SegmentList {
    #[serde(rename = "Initialization")]
    Initialization: Option<Initialization>,
    #[serde(rename = "SegmentURL", default)]
    segment_urls: Vec<SegmentURL>,
    #[serde(rename = "@duration")]
    duration: Option<u64>,
    #[serde(rename = "@timescale")]
    timescale: Option<u64>,
    #[serde(rename = "@startNumber")]
    startNumber: Option<u64>,
    #[serde(rename = "@presentationTimeOffset")]
    presentationTimeOffset: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
struct SegmentBaseXml {
    #[serde(rename = "Initialization")]
    initialization: Option<Initialization>,
    #[serde(rename = "@indexRange")]
    indexRange: Option<String>,
    #[serde(rename = "@timescale")]
    timescale: Option<u64>,
    #[serde(rename = "@presentationTimeOffset")]
    presentationTimeOffset: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
struct DescriptorXml {
    #[serde(rename = "@schemeIdUri")]
    schemeIdUri: Option<String>,
    #[serde(rename = "@value")]
    value: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct Pssh {
    #[serde(rename = "$text")]
    content: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct ContentProtectionXml {
    #[serde(rename = "@schemeIdUri")]
    schemeIdUri: Option<String>,
    #[serde(rename = "pssh")]
    pssh: Option<Pssh>,
}

#[derive(Debug, Deserialize, Clone)]
struct AudioChannelConfiguration {
    #[serde(rename = "@value")]
    value: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct RepresentationXml {
    #[serde(rename = "@id")]
    id: Option<String>,
    #[serde(rename = "@bandwidth")]
    bandwidth: Option<u64>,
    #[serde(rename = "@codecs")]
    codecs: Option<String>,
    #[serde(rename = "@mimeType")]
    mimeType: Option<String>,
    #[serde(rename = "@width")]
    width: Option<u64>,
    #[serde(rename = "@height")]
    height: Option<u64>,
    #[serde(rename = "@audioSamplingRate")]
    audioSamplingRate: Option<u64>,
    #[serde(rename = "AudioChannelConfiguration", default)]
    audio_channel_configurations: Vec<AudioChannelConfiguration>,
    #[serde(rename = "BaseURL", default)]
    base_urls: Vec<BaseURL>,
    #[serde(rename = "SegmentBase")]
    segment_base: Option<SegmentBaseXml>,
    #[serde(rename = "SegmentList")]
    segment_list: Option<SegmentList>,
    #[serde(rename = "SegmentTemplate")]
    segment_template: Option<SegmentTemplate>,
}

#[derive(Debug, Deserialize, Clone)]
struct AdaptationSetXml {
    #[serde(rename = "@id")]
    id: Option<String>,
    #[serde(rename = "@contentType")]
    contentType: Option<String>,
    #[serde(rename = "@mimeType")]
    mimeType: Option<String>,
    #[serde(rename = "@lang")]
    lang: Option<String>,
    #[serde(rename = "BaseURL", default)]
    base_urls: Vec<BaseURL>,
    #[serde(rename = "ContentProtection", default)]
    content_protections: Vec<ContentProtectionXml>,
    #[serde(rename = "SupplementalProperty", default)]
    supplemental_properties: Vec<DescriptorXml>,
    #[serde(rename = "EssentialProperty", default)]
    essential_properties: Vec<DescriptorXml>,
    #[serde(rename = "SegmentBase")]
    segment_base: Option<SegmentBaseXml>,
    #[serde(rename = "SegmentList")]
    segment_list: Option<SegmentList>,
    #[serde(rename = "SegmentTemplate")]
    segment_template: Option<SegmentTemplate>,
    #[serde(rename = "Representation", default)]
    representations: Vec<RepresentationXml>,
}

#[derive(Debug, Deserialize, Clone)]
struct PeriodXml {
    #[serde(rename = "@id")]
    id: Option<String>,
    #[serde(rename = "@start", deserialize_with = "deserialize_xs_duration", default)]
    start: Option<Duration>,
    #[serde(rename = "@duration", deserialize_with = "deserialize_xs_duration", default)]
    duration: Option<Duration>,
    #[serde(rename = "BaseURL", default)]
    base_urls: Vec<BaseURL>,
    #[serde(rename = "SegmentBase")]
    segment_base: Option<SegmentBaseXml>,
    #[serde(rename = "SegmentList")]
    segment_list: Option<SegmentList>,
    #[serde(rename = "SegmentTemplate")]
    segment_template: Option<SegmentTemplate>,
    #[serde(rename = "AdaptationSet", default)]
    adaptation_sets: Vec<AdaptationSetXml>,
}

#[derive(Debug, Deserialize, Clone)]
struct Location {
    #[serde(rename = "$text")]
    url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct MPD {
    #[serde(rename = "@type")]
    mpdtype: Option<String>,
    #[serde(rename = "@availabilityStartTime")]
    availabilityStartTime: Option<String>,
    #[serde(
        rename = "@mediaPresentationDuration",
        deserialize_with = "deserialize_xs_duration",
        default
    )]
    mediaPresentationDuration: Option<Duration>,
    #[serde(rename = "@minBufferTime", deserialize_with = "deserialize_xs_duration", default)]
    minBufferTime: Option<Duration>,
    #[serde(
        rename = "@minimumUpdatePeriod",
        deserialize_with = "deserialize_xs_duration",
        default
    )]
    minimumUpdatePeriod: Option<Duration>,
    #[serde(
        rename = "@timeShiftBufferDepth",
        deserialize_with = "deserialize_xs_duration",
        default
    )]
    timeShiftBufferDepth: Option<Duration>,
    #[serde(rename = "Location")]
    location: Option<Location>,
    #[serde(rename = "BaseURL", default)]
    base_urls: Vec<BaseURL>,
    #[serde(rename = "Period", default)]
    periods: Vec<PeriodXml>,
}

/// Parses MPD XML into the runtime snapshot. `original_url` anchors relative BaseURLs.
pub fn parse_mpd(xml: &str, original_url: &str) -> Result<MediaPresentation, DashError> {
    let deserializer = &mut quick_xml::de::Deserializer::from_str(xml);
    let mpd: MPD = serde_path_to_error::deserialize(deserializer)
        .map_err(|e| DashError::Parsing(format!("deserializing MPD: {e}")))?;
    build_presentation(mpd, original_url)
}

/// The default [`ManifestParser`] over [`parse_mpd`].
#[derive(Debug, Default)]
pub struct XmlManifestParser;

impl ManifestParser for XmlManifestParser {
    fn parse(&self, url: &str, data: &[u8]) -> Result<MediaPresentation, DashError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| DashError::Parsing(format!("manifest is not UTF-8: {e}")))?;
        parse_mpd(text, url)
    }
}

fn merge_base_url(current: &str, new: &[BaseURL]) -> String {
    let Some(first) = new.first() else {
        return String::from(current);
    };
    match Url::parse(current).and_then(|c| c.join(first.base.trim())) {
        Ok(u) => u.to_string(),
        Err(_) => first.base.trim().to_string(),
    }
}

// Parse a range specifier of the form "45-67", as used by Initialization@range and
// SegmentBase@indexRange. Byte ranges are inclusive of both endpoints.
fn parse_range(range: &str) -> Result<(i64, i64), DashError> {
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| DashError::Parsing(format!("invalid range specifier: {range}")))?;
    let start: i64 = start
        .parse()
        .map_err(|_| DashError::Parsing(String::from("invalid start for range specifier")))?;
    let end: i64 = end
        .parse()
        .map_err(|_| DashError::Parsing(String::from("invalid end for range specifier")))?;
    Ok((start, end - start + 1))
}

fn expand_timeline(timeline: &SegmentTimeline) -> Vec<TimelineElement> {
    let mut elements = Vec::new();
    let mut next_start: u64 = 0;
    for s in &timeline.segments {
        let start = s.t.unwrap_or(next_start);
        let repeats = s.r.unwrap_or(0).max(0) as u64;
        for i in 0..=repeats {
            elements.push(TimelineElement { start: start + i * s.d, duration: s.d });
        }
        next_start = start + (repeats + 1) * s.d;
    }
    elements
}

struct SegmentDescription<'a> {
    template: Option<&'a SegmentTemplate>,
    list: Option<&'a SegmentList>,
    base: Option<&'a SegmentBaseXml>,
    inherited: bool,
}

fn build_segment_base(
    description: &SegmentDescription<'_>,
    base_url: &Arc<str>,
    format: &Format,
) -> Result<SegmentBase, DashError> {
    if let Some(template) = description.template {
        let timescale = template.timescale.unwrap_or(1);
        let pto = template.presentationTimeOffset.unwrap_or(0);
        let start_number = template.startNumber.unwrap_or(1) as i32;
        let timeline = template.SegmentTimeline.as_ref().map(expand_timeline);
        let media = template
            .media
            .as_deref()
            .ok_or_else(|| DashError::Parsing(String::from("SegmentTemplate without @media")))?;
        let initialization = template.initialization.as_deref().map(|init| {
            let resolved =
                UrlTemplate::new(init).resolve(&format.id, 0, format.bitrate, 0);
            RangedUri::new(base_url, &resolved, 0, -1)
        });
        return Ok(SegmentBase::Multi(Arc::new(MultiSegmentIndex {
            base_uri: Arc::clone(base_url),
            initialization,
            timescale,
            presentation_time_offset: pto,
            start_number,
            duration: template.duration.unwrap_or(0),
            timeline: timeline.map(Arc::new),
            source: SegmentUrlSource::Template(UrlTemplate::new(media)),
            format_id: format.id.clone(),
            bandwidth: format.bitrate,
        })));
    }

    if let Some(list) = description.list {
        let timescale = list.timescale.unwrap_or(1);
        let pto = list.presentationTimeOffset.unwrap_or(0);
        let start_number = list.startNumber.unwrap_or(1) as i32;
        let duration = list.duration.unwrap_or(0);
        let mut urls = Vec::with_capacity(list.segment_urls.len());
        for segment_url in &list.segment_urls {
            let (start, length) = match segment_url.mediaRange.as_deref() {
                Some(range) => parse_range(range)?,
                None => (0, -1),
            };
            urls.push(RangedUri::new(
                base_url,
                segment_url.media.as_deref().unwrap_or(""),
                start,
                length,
            ));
        }
        // A SegmentList has explicitly listed segments of fixed duration; model it as a
        // one-element-per-segment timeline so it reports explicit availability.
        let timeline: Vec<TimelineElement> = (0..urls.len() as u64)
            .map(|i| TimelineElement { start: pto + i * duration, duration })
            .collect();
        let initialization = build_initialization(list.Initialization.as_ref(), base_url)?;
        return Ok(SegmentBase::Multi(Arc::new(MultiSegmentIndex {
            base_uri: Arc::clone(base_url),
            initialization,
            timescale,
            presentation_time_offset: pto,
            start_number,
            duration,
            timeline: Some(Arc::new(timeline)),
            source: SegmentUrlSource::List(Arc::new(urls)),
            format_id: format.id.clone(),
            bandwidth: format.bitrate,
        })));
    }

    let (initialization, index_range, pto_us) = match description.base {
        Some(base) => {
            let timescale = base.timescale.unwrap_or(1);
            let pto_us = (base.presentationTimeOffset.unwrap_or(0) as i64)
                .saturating_mul(1_000_000)
                / timescale.max(1) as i64;
            let initialization = build_initialization(base.initialization.as_ref(), base_url)?;
            let index_range = match base.indexRange.as_deref() {
                Some(range) => {
                    let (start, length) = parse_range(range)?;
                    Some(RangedUri::new(base_url, "", start, length))
                }
                None => None,
            };
            (initialization, index_range, pto_us)
        }
        None => (None, None, 0),
    };
    Ok(SegmentBase::Single(SingleSegmentBase {
        uri: Arc::clone(base_url),
        initialization,
        index_range,
        presentation_time_offset_us: pto_us,
    }))
}

fn build_initialization(
    initialization: Option<&Initialization>,
    base_url: &Arc<str>,
) -> Result<Option<RangedUri>, DashError> {
    let Some(init) = initialization else {
        return Ok(None);
    };
    let (start, length) = match init.range.as_deref() {
        Some(range) => parse_range(range)?,
        None => (0, -1),
    };
    Ok(Some(RangedUri::new(base_url, init.sourceURL.as_deref().unwrap_or(""), start, length)))
}

fn adaptation_type_of(set: &AdaptationSetXml) -> Option<AdaptationType> {
    let mime = set
        .mimeType
        .as_deref()
        .or_else(|| set.representations.first().and_then(|r| r.mimeType.as_deref()))
        .unwrap_or("");
    match set.contentType.as_deref() {
        Some("video") => return Some(AdaptationType::Video),
        Some("audio") => return Some(AdaptationType::Audio),
        Some("text") => return Some(AdaptationType::Text),
        _ => {}
    }
    if mime.starts_with("video/") {
        Some(AdaptationType::Video)
    } else if mime.starts_with("audio/") {
        Some(AdaptationType::Audio)
    } else if mime.starts_with("text/")
        || mime == "application/ttml+xml"
        || mime == "application/x-rawcc"
    {
        Some(AdaptationType::Text)
    } else {
        None
    }
}

fn build_descriptors(descriptors: &[DescriptorXml]) -> Vec<Descriptor> {
    descriptors
        .iter()
        .filter_map(|d| {
            d.schemeIdUri.as_ref().map(|scheme| Descriptor {
                scheme_id_uri: scheme.clone(),
                value: d.value.clone().unwrap_or_default(),
            })
        })
        .collect()
}

fn build_content_protections(
    protections: &[ContentProtectionXml],
    mime_type: &str,
) -> Vec<ContentProtection> {
    protections
        .iter()
        .filter_map(|cp| {
            let scheme = cp.schemeIdUri.clone()?;
            let uuid = parse_scheme_uuid(&scheme);
            let scheme_init_data = cp
                .pssh
                .as_ref()
                .and_then(|p| p.content.as_deref())
                .and_then(|b64| match BASE64_STANDARD.decode(b64.trim()) {
                    Ok(data) => Some(SchemeInitData::new(mime_type, data.into())),
                    Err(e) => {
                        warn!("Undecodable cenc:pssh payload: {e}");
                        None
                    }
                });
            Some(ContentProtection { scheme_id_uri: scheme, uuid, scheme_init_data })
        })
        .collect()
}

fn build_presentation(mpd: MPD, original_url: &str) -> Result<MediaPresentation, DashError> {
    let dynamic = mpd.mpdtype.as_deref() == Some("dynamic");
    let availability_start_time_ms = match mpd.availabilityStartTime.as_deref() {
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map_err(|e| DashError::Parsing(format!("parsing availabilityStartTime: {e}")))?
            .timestamp_millis(),
        None => 0,
    };
    let duration_ms = mpd
        .mediaPresentationDuration
        .map(|d| d.as_millis() as i64)
        .unwrap_or(DURATION_UNKNOWN_MS);
    let mpd_base = merge_base_url(original_url, &mpd.base_urls);

    let mut periods = Vec::with_capacity(mpd.periods.len());
    let mut next_start_ms: i64 = 0;
    for (period_index, period_xml) in mpd.periods.iter().enumerate() {
        let start_ms = period_xml
            .start
            .map(|d| d.as_millis() as i64)
            .unwrap_or(next_start_ms);
        if let Some(d) = period_xml.duration {
            next_start_ms = start_ms + d.as_millis() as i64;
        }
        let period_base = merge_base_url(&mpd_base, &period_xml.base_urls);

        let mut adaptation_sets = Vec::new();
        for (set_index, set_xml) in period_xml.adaptation_sets.iter().enumerate() {
            let Some(set_type) = adaptation_type_of(set_xml) else {
                warn!("Skipping AdaptationSet with unrecognized content type");
                continue;
            };
            let set_base = merge_base_url(&period_base, &set_xml.base_urls);
            let set_mime = set_xml.mimeType.clone();

            let mut representations = Vec::with_capacity(set_xml.representations.len());
            for (rep_index, rep_xml) in set_xml.representations.iter().enumerate() {
                let mime_type = rep_xml
                    .mimeType
                    .clone()
                    .or_else(|| set_mime.clone())
                    .unwrap_or_default();
                let id = rep_xml
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("{period_index}.{set_index}.{rep_index}"));
                let mut format = Format::new(&id, &mime_type, rep_xml.bandwidth.unwrap_or(0) as i32);
                format.codecs = rep_xml.codecs.clone().unwrap_or_default();
                format.width = rep_xml.width.map(|w| w as i32).unwrap_or(-1);
                format.height = rep_xml.height.map(|h| h as i32).unwrap_or(-1);
                format.audio_sampling_rate =
                    rep_xml.audioSamplingRate.map(|r| r as i32).unwrap_or(-1);
                format.audio_channels = rep_xml
                    .audio_channel_configurations
                    .first()
                    .and_then(|c| c.value.as_deref())
                    .and_then(|v| v.parse::<i32>().ok())
                    .unwrap_or(-1);
                format.language = set_xml.lang.clone().unwrap_or_default();

                let rep_base: Arc<str> =
                    Arc::from(merge_base_url(&set_base, &rep_xml.base_urls).as_str());
                // The closest SegmentBase/SegmentList/SegmentTemplate wins; representation
                // over adaptation set over period.
                let description = if rep_xml.segment_template.is_some()
                    || rep_xml.segment_list.is_some()
                    || rep_xml.segment_base.is_some()
                {
                    SegmentDescription {
                        template: rep_xml.segment_template.as_ref(),
                        list: rep_xml.segment_list.as_ref(),
                        base: rep_xml.segment_base.as_ref(),
                        inherited: false,
                    }
                } else if set_xml.segment_template.is_some()
                    || set_xml.segment_list.is_some()
                    || set_xml.segment_base.is_some()
                {
                    SegmentDescription {
                        template: set_xml.segment_template.as_ref(),
                        list: set_xml.segment_list.as_ref(),
                        base: set_xml.segment_base.as_ref(),
                        inherited: true,
                    }
                } else {
                    SegmentDescription {
                        template: period_xml.segment_template.as_ref(),
                        list: period_xml.segment_list.as_ref(),
                        base: period_xml.segment_base.as_ref(),
                        inherited: true,
                    }
                };
                let segment_base = build_segment_base(&description, &rep_base, &format)?;
                representations.push(Representation::new(
                    original_url,
                    0,
                    format,
                    segment_base,
                    description.inherited,
                ));
            }

            let protection_mime = set_mime.as_deref().unwrap_or("video/mp4");
            adaptation_sets.push(AdaptationSet {
                id: set_xml.id.clone().unwrap_or_else(|| set_index.to_string()),
                set_type,
                representations,
                content_protections: build_content_protections(
                    &set_xml.content_protections,
                    protection_mime,
                ),
                supplemental_properties: build_descriptors(&set_xml.supplemental_properties),
                essential_properties: build_descriptors(&set_xml.essential_properties),
            });
        }

        periods.push(Period {
            id: period_xml.id.clone().unwrap_or_else(|| period_index.to_string()),
            start_ms,
            adaptation_sets,
        });
    }

    Ok(MediaPresentation {
        availability_start_time_ms,
        duration_ms,
        min_buffer_time_ms: mpd.minBufferTime.map(|d| d.as_millis() as i64).unwrap_or(0),
        dynamic,
        min_update_period_ms: mpd
            .minimumUpdatePeriod
            .map(|d| d.as_millis() as i64)
            .unwrap_or(-1),
        time_shift_buffer_depth_ms: mpd
            .timeShiftBufferDepth
            .map(|d| d.as_millis() as i64)
            .unwrap_or(-1),
        location: mpd.location.and_then(|l| l.url),
        periods,
    })
}
