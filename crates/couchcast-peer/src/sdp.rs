//! SDP directives applied to the host's offer before it goes out.
//!
//! Two pure string transforms, no SDP parser:
//!
//! - [`apply_video_bandwidth`] pins the receiver-advertised ceiling by
//!   inserting a `b=AS:` line into the video section (after its `c=` line,
//!   replacing an existing `b=AS:`).
//! - [`prefer_video_codec`] moves the named codec's payload types to the
//!   front of the video `m=` line, which is how SDP expresses codec
//!   preference.
//!
//! Both leave the input untouched when the anchor lines are missing — a
//! malformed offer is the transport's problem, not ours.

/// Inserts or replaces `b=AS:<kbps>` in the video section.
pub fn apply_video_bandwidth(sdp: &str, kbps: u32) -> String {
    let lines: Vec<&str> = sdp.lines().collect();
    let Some(video_start) = lines.iter().position(|l| l.starts_with("m=video")) else {
        return sdp.to_string();
    };
    let video_end = lines[video_start + 1..]
        .iter()
        .position(|l| l.starts_with("m="))
        .map(|p| video_start + 1 + p)
        .unwrap_or(lines.len());

    let bandwidth_line = format!("b=AS:{kbps}");
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 1);
    out.extend(lines[..=video_start].iter().map(|l| l.to_string()));

    let mut inserted = false;
    for line in &lines[video_start + 1..video_end] {
        if line.starts_with("b=AS:") {
            // Existing ceiling: superseded by the inserted one.
            continue;
        }
        out.push(line.to_string());
        if line.starts_with("c=") && !inserted {
            out.push(bandwidth_line.clone());
            inserted = true;
        }
    }
    // A section with no c= line still gets the ceiling, at the end.
    if !inserted {
        out.push(bandwidth_line);
    }
    out.extend(lines[video_end..].iter().map(|l| l.to_string()));

    // Trailing newline preserved: SDP blocks end with one.
    let mut joined = out.join("\r\n");
    if sdp.ends_with('\n') {
        joined.push_str("\r\n");
    }
    joined
}

/// Moves `codec`'s payload types to the front of the video `m=` line.
pub fn prefer_video_codec(sdp: &str, codec: &str) -> String {
    let lines: Vec<&str> = sdp.lines().collect();
    let Some(video_start) = lines.iter().position(|l| l.starts_with("m=video")) else {
        return sdp.to_string();
    };
    let video_end = lines[video_start + 1..]
        .iter()
        .position(|l| l.starts_with("m="))
        .map(|p| video_start + 1 + p)
        .unwrap_or(lines.len());

    // Payload types whose rtpmap names the codec, e.g. `a=rtpmap:96 H264/90000`.
    let preferred: Vec<&str> = lines[video_start + 1..video_end]
        .iter()
        .filter_map(|l| {
            let rest = l.strip_prefix("a=rtpmap:")?;
            let (pt, name) = rest.split_once(' ')?;
            let codec_name = name.split('/').next()?;
            codec_name.eq_ignore_ascii_case(codec).then_some(pt)
        })
        .collect();
    if preferred.is_empty() {
        return sdp.to_string();
    }

    // m=video <port> <proto> <pt> <pt> ...
    let mut fields: Vec<&str> = lines[video_start].split_whitespace().collect();
    if fields.len() <= 3 {
        return sdp.to_string();
    }
    let mut reordered: Vec<&str> = fields[..3].to_vec();
    reordered.extend(fields[3..].iter().filter(|pt| preferred.contains(pt)));
    reordered.extend(fields[3..].iter().filter(|pt| !preferred.contains(pt)));
    fields = reordered;

    let mut out: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    out[video_start] = fields.join(" ");
    let mut joined = out.join("\r\n");
    if sdp.ends_with('\n') {
        joined.push_str("\r\n");
    }
    joined
}

// ── Tests ─────────────────────────────────────────────────────────────────────
