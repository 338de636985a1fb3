//! Built-in signature-based engine
//!
//! Identifies the container from its leading bytes and reports a `General`
//! track. It is a stand-in for a full binary metadata engine and implements
//! the same [`AnalysisEngine`] contract.

use serde_json::{Value, json};
use tracing::debug;

use super::OutputFormat;
use super::engine::{AnalysisEngine, ChunkReader, EngineFactory, EngineOptions, EngineOutput};
use crate::pipeline::core::{AnalyzeError, Result};

const HEAD_LEN: usize = 64 * 1024;
const TS_PACKET: usize = 188;
const LABEL_WIDTH: usize = 41;

/// Container identified from the leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Container {
    pub format: &'static str,
    pub mime: &'static str,
    pub extensions: &'static str,
}

const MATROSKA: Container = Container { format: "Matroska", mime: "video/x-matroska", extensions: "mkv mk3d mka mks" };
const WEBM: Container = Container { format: "WebM", mime: "video/webm", extensions: "webm" };
const MPEG4: Container = Container { format: "MPEG-4", mime: "video/mp4", extensions: "mp4 m4v m4a m4b" };
const QUICKTIME: Container = Container { format: "QuickTime", mime: "video/quicktime", extensions: "mov qt" };
const AVI: Container = Container { format: "AVI", mime: "video/vnd.avi", extensions: "avi" };
const WAVE: Container = Container { format: "Wave", mime: "audio/vnd.wave", extensions: "wav" };
const MPEG_TS: Container = Container { format: "MPEG-TS", mime: "video/MP2T", extensions: "ts m2ts mts" };
const MPEG_PS: Container = Container { format: "MPEG-PS", mime: "video/MP2P", extensions: "mpg mpeg vob" };
const OGG: Container = Container { format: "Ogg", mime: "audio/ogg", extensions: "ogg ogv oga opus" };
const FLAC: Container = Container { format: "FLAC", mime: "audio/x-flac", extensions: "flac" };
const MP3: Container = Container { format: "MPEG Audio", mime: "audio/mpeg", extensions: "mp3" };
const ADTS: Container = Container { format: "ADTS", mime: "audio/aac", extensions: "aac" };

/// Identify a container from its first bytes
pub fn identify(head: &[u8]) -> Option<Container> {
    if head.starts_with(&[0x1a, 0x45, 0xdf, 0xa3]) {
        let doc_type_window = &head[..head.len().min(64)];
        let is_webm = doc_type_window.windows(4).any(|w| w == b"webm");
        return Some(if is_webm { WEBM } else { MATROSKA });
    }

    if head.len() >= 12 {
        match &head[4..8] {
            b"ftyp" => return Some(if &head[8..12] == b"qt  " { QUICKTIME } else { MPEG4 }),
            b"moov" | b"mdat" | b"wide" | b"free" | b"skip" => return Some(QUICKTIME),
            _ => {}
        }
        if &head[0..4] == b"RIFF" {
            match &head[8..12] {
                b"AVI " => return Some(AVI),
                b"WAVE" => return Some(WAVE),
                _ => {}
            }
        }
    }

    if head.starts_with(b"OggS") {
        return Some(OGG);
    }
    if head.starts_with(b"fLaC") {
        return Some(FLAC);
    }
    if head.starts_with(&[0x00, 0x00, 0x01, 0xba]) {
        return Some(MPEG_PS);
    }
    if head.len() > TS_PACKET * 2 && head[0] == 0x47 && head[TS_PACKET] == 0x47 && head[TS_PACKET * 2] == 0x47 {
        return Some(MPEG_TS);
    }
    if head.starts_with(b"ID3") {
        return Some(MP3);
    }
    if head.len() >= 2 && head[0] == 0xff {
        // ADTS: 12-bit sync, layer 00
        if head[1] & 0xf6 == 0xf0 {
            return Some(ADTS);
        }
        // MPEG audio frame sync, layer III
        if head[1] & 0xe0 == 0xe0 && head[1] & 0x06 == 0x02 {
            return Some(MP3);
        }
    }

    None
}

#[derive(Debug, Clone)]
struct Report {
    container: Option<Container>,
    file_size: u64,
}

/// Signature-sniffing engine
pub struct SniffEngine {
    options: EngineOptions,
    format: OutputFormat,
    full: bool,
    report: Option<Report>,
    disposed: bool,
}

impl SniffEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            format: OutputFormat::Json,
            full: false,
            report: None,
            disposed: false,
        }
    }

    fn general_fields(&self, report: &Report) -> Vec<(&'static str, &'static str, String)> {
        let mut fields = Vec::new();
        if let Some(container) = report.container {
            fields.push(("Format", "Format", container.format.to_string()));
            if self.full {
                fields.push(("FileExtension", "Format/Extensions usually used", container.extensions.to_string()));
                fields.push(("InternetMediaType", "Internet media type", container.mime.to_string()));
            }
        }
        if report.file_size > 0 {
            fields.push(("FileSize", "File size", report.file_size.to_string()));
        }
        fields
    }

    fn render_object(&self, report: &Report) -> Value {
        let mut general = serde_json::Map::new();
        general.insert("@type".to_string(), json!("General"));
        for (key, _, value) in self.general_fields(report) {
            general.insert(key.to_string(), json!({ "#value": value }));
        }

        json!({
            "creatingLibrary": {
                "name": "inspector-sniff",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "media": {
                "@ref": "",
                "track": [Value::Object(general)],
            }
        })
    }

    fn render_report(&self, report: &Report) -> Result<String> {
        let fields = self.general_fields(report);
        let rendered = match self.format {
            OutputFormat::Json => serde_json::to_string(&self.render_object(report)).map_err(|e| {
                AnalyzeError::AnalysisEngineFailure {
                    format: self.format.key().to_string(),
                    reason: e.to_string(),
                }
            })?,
            OutputFormat::Text => {
                let mut out = String::from("General\n");
                for (_, label, value) in &fields {
                    out.push_str(&format!("{:<width$}: {}\n", label, value, width = LABEL_WIDTH));
                }
                out
            }
            OutputFormat::Xml => {
                let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<MediaInfo>\n<media>\n<track type=\"General\">\n");
                for (key, _, value) in &fields {
                    out.push_str(&format!("<{key}>{}</{key}>\n", escape_markup(value)));
                }
                out.push_str("</track>\n</media>\n</MediaInfo>\n");
                out
            }
            OutputFormat::Html => {
                let mut out = String::from("<html>\n<body>\n<table width=\"100%\" border=\"0\" cellpadding=\"1\" cellspacing=\"2\">\n<tr><td><h2>General</h2></td></tr>\n");
                for (_, label, value) in &fields {
                    out.push_str(&format!(
                        "<tr><td><i>{}:</i></td><td>{}</td></tr>\n",
                        escape_markup(label),
                        escape_markup(value)
                    ));
                }
                out.push_str("</table>\n</body>\n</html>\n");
                out
            }
        };
        Ok(rendered)
    }
}

impl AnalysisEngine for SniffEngine {
    fn configure(&mut self, format: OutputFormat, full: bool) -> Result<()> {
        self.format = format;
        self.full = full;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.report = None;
        Ok(())
    }

    fn analyze(&mut self, reader: &dyn ChunkReader) -> Result<EngineOutput> {
        if self.disposed {
            return Err(AnalyzeError::AnalysisEngineFailure {
                format: self.format.key().to_string(),
                reason: "engine already disposed".to_string(),
            });
        }

        let head = reader.read_chunk(0, HEAD_LEN.min(self.options.chunk_size))?;
        let report = Report {
            container: identify(head),
            file_size: reader.total_size(),
        };
        debug!("Sniffed {:?} from {} leading bytes", report.container.map(|c| c.format), head.len());

        let output = match self.format {
            OutputFormat::Json => EngineOutput::Structured(self.render_object(&report)),
            _ => EngineOutput::Text(self.render_report(&report)?),
        };
        self.report = Some(report);
        Ok(output)
    }

    fn render_text(&mut self) -> Result<String> {
        match &self.report {
            Some(report) => self.render_report(report),
            None => Ok(String::new()),
        }
    }

    fn dispose(&mut self) {
        self.report = None;
        self.disposed = true;
    }
}

/// Factory for [`SniffEngine`] instances
#[derive(Debug, Clone, Copy, Default)]
pub struct SniffEngineFactory;

impl EngineFactory for SniffEngineFactory {
    fn create(&self, options: &EngineOptions) -> Result<Box<dyn AnalysisEngine>> {
        Ok(Box::new(SniffEngine::new(options.clone())))
    }
}

fn escape_markup(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
