// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `SETUP` URL derivation: splitting a request URL into the presentation's
//! base path and the addressed track id.
//!
//! The control attribute's value may be a full URL, a relative
//! `trackID=<n>` token, or any custom token, so the publisher-side
//! derivation strips the exact control suffix rather than assuming a
//! `trackID=` shape. `/` separators inside a query string are tolerated.

use url::Url;

use crate::Tracks;

/// The request URL's path and query, joined, without the leading `/`.
pub(crate) fn path_and_query(url: &Url) -> String {
    let mut s = url.path().trim_start_matches('/').to_owned();
    if let Some(q) = url.query() {
        s.push('?');
        s.push_str(q);
    }
    s
}

/// The request URL's path without query, trimmed of surrounding slashes.
/// Used for `DESCRIBE`/`ANNOUNCE`, which address the whole presentation.
pub(crate) fn presentation_path(url: &Url) -> String {
    url.path().trim_matches('/').to_owned()
}

/// Reader-side derivation: the track id comes from a trailing
/// `/trackID=<n>`, defaulting to 0 when absent (ffmpeg addresses
/// single-track MPEG-TS streams with a bare trailing slash).
pub(crate) fn parse_setup_path(path_and_query: &str) -> Result<(String, usize), String> {
    const MARKER: &str = "/trackID=";
    match path_and_query.rfind(MARKER) {
        Some(i) => {
            let id_str = &path_and_query[i + MARKER.len()..];
            let id = usize::from_str_radix(id_str, 10)
                .map_err(|_| format!("bad track id {:?}", id_str))?;
            Ok((strip_query(&path_and_query[..i]), id))
        }
        None => Ok((strip_query(path_and_query), 0)),
    }
}

/// Publisher-side derivation: the addressed track is the announced track
/// whose control attribute value is the URL's suffix; the id is that
/// track's announced index, regardless of what the control value names.
pub(crate) fn parse_setup_path_announced(
    request_pq: &str,
    announced: &Tracks,
) -> Result<(String, usize), String> {
    for track in announced.iter() {
        let control = match track.control() {
            Some(c) => c,
            None => continue,
        };
        if control.starts_with("rtsp://") || control.starts_with("rtsps://") {
            // Absolute control: compare against its own path and query.
            if let Ok(control_url) = Url::parse(control) {
                let control_pq = path_and_query(&control_url);
                if request_pq == control_pq {
                    let (base, _) = parse_setup_path(&control_pq)?;
                    return Ok((base, track.id));
                }
            }
            continue;
        }
        if let Some(base) = request_pq.strip_suffix(control) {
            return Ok((base.trim_end_matches('/').to_owned(), track.id));
        }
    }
    Err(format!("no announced track matches {:?}", request_pq))
}

fn strip_query(s: &str) -> String {
    match s.find('?') {
        Some(i) => &s[..i],
        None => s,
    }
    .trim_end_matches('/')
    .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pq(url: &str) -> String {
        path_and_query(&Url::parse(url).unwrap())
    }

    #[test]
    fn read_side_derivation() {
        for (url, path, track_id) in [
            ("rtsp://localhost:8554/teststream/trackID=2", "teststream", 2),
            (
                "rtsp://localhost:8554/teststream?testing=123/trackID=4",
                "teststream",
                4,
            ),
            ("rtsp://localhost:8554/teststream/", "teststream", 0),
            ("rtsp://localhost:8554/test/stream/trackID=0", "test/stream", 0),
            ("rtsp://localhost:8554/test/stream/", "test/stream", 0),
            (
                "rtsp://localhost:8554/test/stream?testing=123/trackID=4",
                "test/stream",
                4,
            ),
        ] {
            let (p, id) = parse_setup_path(&pq(url)).unwrap();
            assert_eq!(p, path, "{}", url);
            assert_eq!(id, track_id, "{}", url);
        }
    }

    fn announced(control: &str) -> Tracks {
        let sdp = format!(
            "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=Stream\r\nt=0 0\r\n\
             m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:{}\r\n",
            control
        );
        Tracks::from_sdp(sdp.as_bytes()).unwrap()
    }

    #[test]
    fn publish_side_derivation() {
        for (control, url, path) in [
            ("trackID=0", "rtsp://localhost:8554/teststream/trackID=0", "teststream"),
            // the id is the announced index, not the control's number
            ("trackID=2", "rtsp://localhost:8554/teststream/trackID=2", "teststream"),
            ("testing=0", "rtsp://localhost:8554/teststream/testing=0", "teststream"),
            ("?testing=0", "rtsp://localhost:8554/teststream?testing=0", "teststream"),
            ("trackID=0", "rtsp://localhost:8554/test/stream/trackID=0", "test/stream"),
            ("?testing=0", "rtsp://localhost:8554/test/stream?testing=0", "test/stream"),
        ] {
            let tracks = announced(control);
            let (p, id) = parse_setup_path_announced(&pq(url), &tracks).unwrap();
            assert_eq!(p, path, "{} {}", control, url);
            assert_eq!(id, 0, "{} {}", control, url);
        }
    }

    #[test]
    fn publish_side_no_match() {
        let tracks = announced("trackID=0");
        assert!(parse_setup_path_announced(&pq("rtsp://h/teststream/trackID=9"), &tracks).is_err());
    }
}
