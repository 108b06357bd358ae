//! DIDL-Lite metadata for `SetAVTransportURI`.

use std::fmt;

use quick_xml::escape::escape;

/// Kind hint selecting the UPnP class of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaKind {
    #[default]
    Video,
    Audio,
    Image,
}

impl MediaKind {
    /// Parse a kind hint; anything unknown is a video.
    pub fn from_hint(hint: &str) -> Self {
        match hint.to_ascii_lowercase().as_str() {
            "audio" => MediaKind::Audio,
            "image" => MediaKind::Image,
            _ => MediaKind::Video,
        }
    }

    pub fn upnp_class(self) -> &'static str {
        match self {
            MediaKind::Video => "object.item.videoItem",
            MediaKind::Audio => "object.item.audioItem",
            MediaKind::Image => "object.item.imageItem",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.upnp_class())
    }
}

/// A playable item described to a renderer.
///
/// ```
/// use dlna_sdk::{MediaItem, MediaKind};
///
/// let item = MediaItem::new("http://192.168.1.10:8000/movie.mkv", "Movie")
///     .with_kind(MediaKind::Video)
///     .with_subtitles("http://192.168.1.10:8000/movie.srt");
/// assert!(item.to_didl(false).contains("sec:CaptionInfoEx"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub uri: String,
    pub title: String,
    pub kind: MediaKind,
    /// Size in bytes
    pub size: Option<u64>,
    /// `H:MM:SS` duration
    pub duration: Option<String>,
    pub subtitles_uri: Option<String>,
}

impl MediaItem {
    pub fn new(uri: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            title: title.into(),
            kind: MediaKind::default(),
            size: None,
            duration: None,
            subtitles_uri: None,
        }
    }

    pub fn with_kind(mut self, kind: MediaKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_duration(mut self, duration: impl Into<String>) -> Self {
        self.duration = Some(duration.into());
        self
    }

    pub fn with_subtitles(mut self, uri: impl Into<String>) -> Self {
        self.subtitles_uri = Some(uri.into());
        self
    }

    /// Subtitle URI and its extension, when the extension is short enough
    /// to be a real one.
    fn caption(&self) -> Option<(&str, &str)> {
        let uri = self.subtitles_uri.as_deref()?;
        let (_, extension) = uri.rsplit_once('.')?;
        (!extension.is_empty() && extension.chars().count() <= 4).then_some((uri, extension))
    }

    /// Render the DIDL-Lite document.
    ///
    /// `local` describes a resource served by the local delivery server:
    /// no `sec:URIType`, range requests allowed (`DLNA.ORG_OP=01`) and the
    /// streaming flags raised.
    pub fn to_didl(&self, local: bool) -> String {
        let (operations, flags, uri_type) = if local {
            ("01", "217", "")
        } else {
            ("00", "017", " sec:URIType=\"public\"")
        };
        let size = self
            .size
            .map(|size| format!(" size=\"{}\"", size))
            .unwrap_or_default();
        let duration = self
            .duration
            .as_deref()
            .filter(|duration| !duration.is_empty())
            .map(|duration| format!(" duration=\"{}\"", escape(duration)))
            .unwrap_or_default();
        let caption = self
            .caption()
            .map(|(uri, extension)| {
                format!(
                    "<sec:CaptionInfoEx sec:type=\"{}\">{}</sec:CaptionInfoEx>",
                    escape(extension),
                    escape(uri)
                )
            })
            .unwrap_or_default();

        format!(
            "<DIDL-Lite \
             xmlns:dc=\"http://purl.org/dc/elements/1.1/\" \
             xmlns:dlna=\"urn:schemas-dlna-org:metadata-1-0/\" \
             xmlns:upnp=\"urn:schemas-upnp-org:metadata-1-0/upnp/\" \
             xmlns:sec=\"http://www.sec.co.kr/\" \
             xmlns=\"urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/\">\
             <item restricted=\"1\" id=\"PlayOn-content\" parentID=\"\">\
             <upnp:class>{class}</upnp:class>\
             <dc:title>{title}</dc:title>\
             <res protocolInfo=\"http-get:*:application/octet-stream:DLNA.ORG_PN=;DLNA.ORG_OP={operations};DLNA.ORG_FLAGS={flags}00000000000000000000000000000\"{uri_type}{size}{duration}>{uri}</res>\
             {caption}\
             </item>\
             </DIDL-Lite>",
            class = self.kind.upnp_class(),
            title = escape(self.title.as_str()),
            operations = operations,
            flags = flags,
            uri_type = uri_type,
            size = size,
            duration = duration,
            uri = escape(self.uri.as_str()),
            caption = caption,
        )
    }
}
