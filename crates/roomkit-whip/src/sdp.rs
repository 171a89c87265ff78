//! SDP string utilities
//!
//! Trickle fragments, ICE credential extraction, restart-answer rewriting
//! and offer codec restriction. All functions are pure and operate on the
//! `\r\n`-delimited SDP text directly.

use crate::error::{Error, Result};

/// Local ICE credentials lifted from an offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

/// Candidates gathered for one media section
#[derive(Debug, Clone)]
pub struct MediaCandidates {
    pub mid: String,
    pub kind: String,
    /// Candidate attribute bodies, e.g. `candidate:1 1 UDP 2130706431 ...`
    pub candidates: Vec<String>,
}

/// One m-line of a session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    pub mid: String,
    pub kind: String,
}

/// Lists the media sections of an SDP in order, pairing each `m=` line
/// with its `a=mid` attribute
pub fn media_sections(sdp: &str) -> Vec<MediaSection> {
    let mut sections = Vec::new();
    let mut kind: Option<String> = None;
    for line in sdp.lines() {
        if let Some(rest) = line.strip_prefix("m=") {
            kind = rest.split(' ').next().map(str::to_string);
        } else if let Some(mid) = line.strip_prefix("a=mid:") {
            if let Some(kind) = kind.take() {
                sections.push(MediaSection {
                    mid: mid.trim_end().to_string(),
                    kind,
                });
            }
        }
    }
    sections
}

fn attribute_value<'a>(sdp: &'a str, name: &str) -> Option<&'a str> {
    let prefix = format!("a={name}:");
    sdp.lines()
        .find_map(|line| line.strip_prefix(prefix.as_str()))
        .map(str::trim_end)
}

/// Extracts the first ice-ufrag/ice-pwd pair from an SDP
pub fn extract_ice_credentials(sdp: &str) -> Result<IceCredentials> {
    let ufrag = attribute_value(sdp, "ice-ufrag")
        .ok_or_else(|| Error::Sdp("missing a=ice-ufrag".to_string()))?;
    let pwd = attribute_value(sdp, "ice-pwd")
        .ok_or_else(|| Error::Sdp("missing a=ice-pwd".to_string()))?;
    Ok(IceCredentials {
        ufrag: ufrag.to_string(),
        pwd: pwd.to_string(),
    })
}

/// Builds an `application/trickle-ice-sdpfrag` body: the ICE credentials
/// followed by one pseudo media section per mid carrying its candidates.
pub fn trickle_fragment(
    creds: &IceCredentials,
    medias: &[MediaCandidates],
    end_of_candidates: bool,
) -> String {
    let mut frag = format!("a=ice-ufrag:{}\r\na=ice-pwd:{}\r\n", creds.ufrag, creds.pwd);
    for media in medias {
        frag.push_str(&format!(
            "m={} 9 UDP/TLS/RTP/SAVPF 0\r\na=mid:{}\r\n",
            media.kind, media.mid
        ));
        for candidate in &media.candidates {
            frag.push_str(&format!("a={candidate}\r\n"));
        }
        if end_of_candidates {
            frag.push_str("a=end-of-candidates\r\n");
        }
    }
    frag
}

/// Applies an ICE-restart answer fragment to the current remote
/// description: every ice-ufrag/ice-pwd is replaced with the fragment's,
/// stale remote candidates are dropped and the fragment's candidates are
/// inserted after each media line.
pub fn apply_restart_answer(remote_sdp: &str, answer_frag: &str) -> Result<String> {
    let creds = extract_ice_credentials(answer_frag)?;
    let new_candidates: Vec<&str> = answer_frag
        .lines()
        .filter(|line| line.starts_with("a=candidate:"))
        .map(str::trim_end)
        .collect();

    let mut out = String::with_capacity(remote_sdp.len());
    for line in remote_sdp.lines() {
        if line.starts_with("a=candidate:") || line == "a=end-of-candidates" {
            continue;
        }
        if line.starts_with("a=ice-ufrag:") {
            out.push_str(&format!("a=ice-ufrag:{}\r\n", creds.ufrag));
        } else if line.starts_with("a=ice-pwd:") {
            out.push_str(&format!("a=ice-pwd:{}\r\n", creds.pwd));
        } else {
            out.push_str(line);
            out.push_str("\r\n");
            if line.starts_with("m=") {
                for candidate in &new_candidates {
                    out.push_str(candidate);
                    out.push_str("\r\n");
                }
            }
        }
    }
    Ok(out)
}

/// Restricts the payload types of every `m=<kind>` section to codecs whose
/// rtpmap name matches one of `allowed` (case-insensitive). Payload types
/// without an rtpmap entry are left alone. Returns the SDP unchanged when
/// `allowed` is empty.
pub fn restrict_codecs(sdp: &str, kind: &str, allowed: &[String]) -> String {
    if allowed.is_empty() {
        return sdp.to_string();
    }
    let section_prefix = format!("m={kind} ");
    let mut out = String::with_capacity(sdp.len());
    let lines: Vec<&str> = sdp.lines().collect();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if !line.starts_with(section_prefix.as_str()) {
            out.push_str(line);
            out.push_str("\r\n");
            i += 1;
            continue;
        }

        // Collect the section and decide which payload types survive
        let mut end = i + 1;
        while end < lines.len() && !lines[end].starts_with("m=") {
            end += 1;
        }
        let section = &lines[i..end];
        let mut removed: Vec<&str> = Vec::new();
        for attr in section {
            if let Some(rest) = attr.strip_prefix("a=rtpmap:") {
                let mut parts = rest.splitn(2, ' ');
                let pt = parts.next().unwrap_or_default();
                let codec = parts
                    .next()
                    .and_then(|desc| desc.split('/').next())
                    .unwrap_or_default();
                if !allowed.iter().any(|a| a.eq_ignore_ascii_case(codec)) {
                    removed.push(pt);
                }
            }
        }

        let mut fields: Vec<&str> = line.split(' ').collect();
        let payloads: Vec<&str> = fields
            .split_off(3)
            .into_iter()
            .filter(|pt| !removed.contains(pt))
            .collect();
        out.push_str(&fields.join(" "));
        for pt in &payloads {
            out.push(' ');
            out.push_str(pt);
        }
        out.push_str("\r\n");

        for attr in &section[1..] {
            let dropped = ["a=rtpmap:", "a=fmtp:", "a=rtcp-fb:"].iter().any(|prefix| {
                attr.strip_prefix(prefix)
                    .and_then(|rest| rest.split([' ', '/']).next())
                    .is_some_and(|pt| removed.contains(&pt))
            });
            if !dropped {
                out.push_str(attr);
                out.push_str("\r\n");
            }
        }
        i = end;
    }
    out
}
