use std::fmt::Write as _;
use std::str::FromStr;

use crate::{Result, RtspError};

/// One `m=` section of a session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub media_type: String,
    pub port: u16,
    pub protocol: String,
    /// RTP payload types listed on the `m=` line.
    pub formats: Vec<u8>,
    pub attributes: Vec<(String, String)>,
}

impl MediaDescription {
    pub fn new(media_type: &str, port: u16, protocol: &str, formats: Vec<u8>) -> Self {
        Self {
            media_type: media_type.to_string(),
            port,
            protocol: protocol.to_string(),
            formats,
            attributes: Vec::new(),
        }
    }

    pub fn get_attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attribute(&mut self, name: &str, value: &str) {
        match self.attributes.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => slot.1 = value.to_string(),
            None => self.attributes.push((name.to_string(), value.to_string())),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.set_attribute(name, value);
        self
    }

    /// The `a=control` attribute, if any.
    pub fn control(&self) -> Option<&str> {
        self.get_attribute("control")
    }

    pub fn has_format(&self, payload_type: u8) -> bool {
        self.formats.contains(&payload_type)
    }

    /// Encoding of a payload type, from its `a=rtpmap` line.
    pub fn rtpmap(&self, payload_type: u8) -> Option<&str> {
        let prefix = format!("{} ", payload_type);
        self.attributes
            .iter()
            .filter(|(k, _)| k == "rtpmap")
            .find_map(|(_, v)| v.strip_prefix(prefix.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub version: i32,
    pub origin: Option<String>,
    pub session_name: Option<String>,
    pub connection: Option<String>,
    pub time: Option<String>,
    pub attributes: Vec<(String, String)>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn new() -> Self {
        Self {
            version: 0,
            origin: None,
            session_name: None,
            connection: None,
            time: None,
            attributes: Vec::new(),
            media: Vec::new(),
        }
    }

    pub fn with_media(mut self, media: MediaDescription) -> Self {
        self.media.push(media);
        self
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut sdp = SessionDescription::new();
        let mut current_media: Option<MediaDescription> = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (typ, value) = match line.split_once('=') {
                Some((t, v)) if t.len() == 1 => (t, v.trim()),
                _ => return Err(RtspError::Protocol("Invalid SDP line format".into())),
            };

            match (typ, current_media.as_mut()) {
                ("v", _) => sdp.version = i32::from_str(value)?,
                ("o", _) => sdp.origin = Some(value.to_string()),
                ("s", _) => sdp.session_name = Some(value.to_string()),
                ("c", None) => sdp.connection = Some(value.to_string()),
                ("t", _) => sdp.time = Some(value.to_string()),
                ("m", _) => {
                    if let Some(media) = current_media.take() {
                        sdp.media.push(media);
                    }

                    // <media> <port> <proto> <fmt> ...
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 4 {
                        return Err(RtspError::Protocol("Invalid media description".into()));
                    }

                    let port = u16::from_str(parts[1].split('/').next().unwrap_or(parts[1]))?;
                    let formats = parts[3..]
                        .iter()
                        .map(|f| u8::from_str(f))
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    current_media = Some(MediaDescription::new(parts[0], port, parts[2], formats));
                }
                ("a", target) => {
                    let (name, val) = value.split_once(':').unwrap_or((value, ""));
                    let attrs = match target {
                        Some(media) => &mut media.attributes,
                        None => &mut sdp.attributes,
                    };
                    attrs.push((name.to_string(), val.to_string()));
                }
                _ => {}
            }
        }

        if let Some(media) = current_media {
            sdp.media.push(media);
        }

        Ok(sdp)
    }

    pub fn marshal(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "v={}\r\n", self.version);
        let _ = write!(
            out,
            "o={}\r\n",
            self.origin.as_deref().unwrap_or("- 0 0 IN IP4 127.0.0.1")
        );
        let _ = write!(out, "s={}\r\n", self.session_name.as_deref().unwrap_or("Stream"));
        if let Some(c) = &self.connection {
            let _ = write!(out, "c={}\r\n", c);
        }
        let _ = write!(out, "t={}\r\n", self.time.as_deref().unwrap_or("0 0"));
        write_attributes(&mut out, &self.attributes);

        for media in &self.media {
            let formats: Vec<String> = media.formats.iter().map(|f| f.to_string()).collect();
            let _ = write!(
                out,
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                formats.join(" ")
            );
            write_attributes(&mut out, &media.attributes);
        }

        out
    }

    pub fn get_media(&self, media_type: &str) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.media_type == media_type)
    }

    pub fn get_attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Gives every media without a control attribute the control
    /// `trackID=<index>`.
    pub fn ensure_controls(&mut self) {
        for (i, media) in self.media.iter_mut().enumerate() {
            if media.control().is_none() {
                media.set_attribute("control", &format!("trackID={}", i));
            }
        }
    }

    /// Finds the media a SETUP request addresses.
    ///
    /// `path` is the request path relative to the stream path (for example
    /// `trackID=1`, or empty for an aggregate URL). Absolute controls are
    /// compared by their trailing path segment.
    pub fn find_media_by_control(&self, path: &str) -> Option<usize> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return if self.media.len() == 1 { Some(0) } else { None };
        }
        self.media.iter().position(|media| match media.control() {
            Some(control) => {
                let control = control.trim_matches('/');
                control == path
                    || control.ends_with(&format!("/{}", path))
                    || path.ends_with(&format!("/{}", control))
            }
            None => false,
        })
    }
}

fn write_attributes(out: &mut String, attributes: &[(String, String)]) {
    for (name, value) in attributes {
        if value.is_empty() {
            let _ = write!(out, "a={}\r\n", name);
        } else {
            let _ = write!(out, "a={}:{}\r\n", name, value);
        }
    }
}

impl Default for SessionDescription {
    fn default() -> Self {
        Self::new()
    }
}
