// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Track enumeration: the minimal SDP handling needed to map a presentation
//! onto per-track transport. Codec parameters pass through untouched.

use bytes::Bytes;
use url::Url;

/// One elementary media stream within a presentation.
///
/// Tracks are created by the publishing side: assigned by the client during
/// `ANNOUNCE`, or enumerated from a `DESCRIBE` body. Ids are dense from 0.
#[derive(Clone, Debug)]
pub struct Track {
    /// Identifier, unique and dense within the presentation.
    pub id: usize,

    /// The presentation URL the track hangs off.
    pub base_url: Option<Url>,

    /// The SDP media description, retained as parsed.
    pub media: sdp_types::Media,
}

impl Track {
    /// The `a=control` attribute value. Mandatory in this library; its value
    /// determines the `SETUP`-time path suffix.
    pub fn control(&self) -> Option<&str> {
        self.media
            .attributes
            .iter()
            .rev()
            .find(|a| a.attribute == "control")
            .and_then(|a| a.value.as_deref())
    }

    /// The RTP clock rate from `a=rtpmap`, defaulting to 90 kHz (the
    /// convention for dynamically-typed video) when absent.
    pub fn clock_rate(&self) -> u32 {
        self.rtpmap()
            .and_then(|v| {
                // rtpmap-value = encoding-name "/" clock-rate [ "/" encoding-params ]
                let mut it = v.splitn(3, '/');
                it.next();
                it.next()
                    .and_then(|c| u32::from_str_radix(c.trim(), 10).ok())
            })
            .unwrap_or(90_000)
    }

    /// The encoding name from `a=rtpmap`, lowercased, if present.
    pub fn encoding_name(&self) -> Option<String> {
        self.rtpmap()
            .and_then(|v| v.split('/').next())
            .map(|e| e.to_ascii_lowercase())
    }

    /// The (first) RTP payload type of the media section.
    pub fn rtp_payload_type(&self) -> Option<u8> {
        self.media
            .fmt
            .split_ascii_whitespace()
            .next()
            .and_then(|f| u8::from_str_radix(f, 10).ok())
    }

    /// The URL a `SETUP` request for this track addresses: the base URL with
    /// the control value appended (or the control value itself when it is a
    /// full URL).
    pub fn setup_url(&self) -> Result<Url, String> {
        let base = self
            .base_url
            .as_ref()
            .ok_or_else(|| "track has no base URL".to_owned())?;
        let control = self
            .control()
            .ok_or_else(|| "track has no control attribute".to_owned())?;
        join_control(base, control)
    }

    /// Replaces any `a=control` with the given value.
    pub(crate) fn set_control(&mut self, value: String) {
        self.media.attributes.retain(|a| a.attribute != "control");
        self.media.attributes.push(sdp_types::Attribute {
            attribute: "control".to_owned(),
            value: Some(value),
        });
    }

    fn rtpmap(&self) -> Option<&str> {
        // Prefer the rtpmap whose payload type matches the media's first fmt.
        let pt = self.media.fmt.split_ascii_whitespace().next();
        self.media
            .attributes
            .iter()
            .filter(|a| a.attribute == "rtpmap")
            .filter_map(|a| a.value.as_deref())
            .find_map(|v| match v.split_once(' ') {
                Some((p, rest)) if pt == Some(p) => Some(rest),
                _ => None,
            })
    }
}

/// Appends a control value to a base URL per RFC 2326 appendix C.1.1.
pub(crate) fn join_control(base: &Url, control: &str) -> Result<Url, String> {
    if control.starts_with("rtsp://") || control.starts_with("rtsps://") {
        return Url::parse(control).map_err(|e| format!("bad control url {:?}: {}", control, e));
    }
    let mut s = base.as_str().trim_end_matches('/').to_owned();
    if !control.starts_with('?') {
        s.push('/');
    }
    s.push_str(control);
    Url::parse(&s).map_err(|e| format!("bad joined control url {:?}: {}", s, e))
}

/// The ordered set of tracks in one presentation.
#[derive(Clone, Debug, Default)]
pub struct Tracks(pub Vec<Track>);

impl Tracks {
    /// Enumerates tracks from a `DESCRIBE` or `ANNOUNCE` SDP body.
    ///
    /// Every media section must carry an `a=control` attribute; the rest of
    /// the SDP passes through unvalidated.
    pub fn from_sdp(body: &[u8]) -> Result<Self, String> {
        let session = sdp_types::Session::parse(body).map_err(|e| format!("bad SDP: {}", e))?;
        let tracks = session
            .medias
            .into_iter()
            .enumerate()
            .map(|(i, media)| {
                let t = Track {
                    id: i,
                    base_url: None,
                    media,
                };
                if t.control().is_none() {
                    return Err(format!("media {} has no control attribute", i));
                }
                Ok(t)
            })
            .collect::<Result<Vec<_>, String>>()?;
        Ok(Tracks(tracks))
    }

    /// Serializes the tracks into an `ANNOUNCE`/`DESCRIBE` body.
    pub fn to_sdp(&self) -> Bytes {
        let mut s = String::with_capacity(256);
        s.push_str("v=0\r\n");
        s.push_str("o=- 0 0 IN IP4 127.0.0.1\r\n");
        s.push_str("s=Stream\r\n");
        s.push_str("c=IN IP4 0.0.0.0\r\n");
        s.push_str("t=0 0\r\n");
        for t in &self.0 {
            s.push_str(&format!(
                "m={} {} {} {}\r\n",
                t.media.media, t.media.port, t.media.proto, t.media.fmt
            ));
            for a in &t.media.attributes {
                match &a.value {
                    Some(v) => s.push_str(&format!("a={}:{}\r\n", a.attribute, v)),
                    None => s.push_str(&format!("a={}\r\n", a.attribute)),
                }
            }
        }
        Bytes::from(s)
    }

    /// Prepares tracks for `ANNOUNCE`: assigns dense ids, sets the base URL,
    /// and rewrites each control attribute to `trackID=<id>`.
    pub(crate) fn prepare_for_announce(&mut self, base_url: &Url) {
        for (i, t) in self.0.iter_mut().enumerate() {
            t.id = i;
            t.base_url = Some(base_url.clone());
            t.set_control(format!("trackID={}", i));
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Track> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &[u8] = b"v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        s=Stream\r\n\
        c=IN IP4 0.0.0.0\r\n\
        t=0 0\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=control:trackID=0\r\n\
        m=audio 0 RTP/AVP 97\r\n\
        a=rtpmap:97 MPEG4-GENERIC/48000/2\r\n\
        a=control:trackID=1\r\n";

    #[test]
    fn enumerate() {
        let tracks = Tracks::from_sdp(SDP).unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks.0[0].id, 0);
        assert_eq!(tracks.0[0].control(), Some("trackID=0"));
        assert_eq!(tracks.0[0].clock_rate(), 90_000);
        assert_eq!(tracks.0[0].encoding_name().as_deref(), Some("h264"));
        assert_eq!(tracks.0[0].rtp_payload_type(), Some(96));
        assert_eq!(tracks.0[1].clock_rate(), 48_000);
    }

    #[test]
    fn missing_control_rejected() {
        let sdp = b"v=0\r\n\
            o=- 0 0 IN IP4 127.0.0.1\r\n\
            s=Stream\r\n\
            t=0 0\r\n\
            m=video 0 RTP/AVP 96\r\n\
            a=rtpmap:96 H264/90000\r\n";
        assert!(Tracks::from_sdp(sdp).is_err());
    }

    #[test]
    fn sdp_survives_round_trip() {
        let tracks = Tracks::from_sdp(SDP).unwrap();
        let body = tracks.to_sdp();
        let again = Tracks::from_sdp(&body).unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(again.0[1].control(), Some("trackID=1"));
        assert_eq!(again.0[1].clock_rate(), 48_000);
    }

    #[test]
    fn announce_rewrites_control() {
        let mut tracks = Tracks::from_sdp(SDP).unwrap();
        let url = Url::parse("rtsp://localhost:8554/teststream").unwrap();
        tracks.prepare_for_announce(&url);
        assert_eq!(tracks.0[1].control(), Some("trackID=1"));
        assert_eq!(
            tracks.0[1].setup_url().unwrap().as_str(),
            "rtsp://localhost:8554/teststream/trackID=1"
        );
    }

    #[test]
    fn control_join_variants() {
        let base = Url::parse("rtsp://localhost:8554/test/stream").unwrap();
        assert_eq!(
            join_control(&base, "trackID=2").unwrap().as_str(),
            "rtsp://localhost:8554/test/stream/trackID=2"
        );
        assert_eq!(
            join_control(&base, "?testing=0").unwrap().as_str(),
            "rtsp://localhost:8554/test/stream?testing=0"
        );
        assert_eq!(
            join_control(&base, "rtsp://other/abs").unwrap().as_str(),
            "rtsp://other/abs"
        );
    }
}
