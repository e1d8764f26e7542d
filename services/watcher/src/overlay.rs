//! Burned-in timestamp captions for clips.
//!
//! The caption is an FFmpeg `drawtext` filter appended to the encoder's
//! filter chain. FFmpeg evaluates it per output frame as the clip's first
//! capture time plus the frame's presentation time, printed as
//! `YYYY-MM-DD HH:MM:SS` bottom-left on a dark box.

use chrono::{DateTime, Utc};

/// strftime format of the caption.
pub const CAPTION_FORMAT: &str = "%Y-%m-%d %T";

/// Caption font size for a frame height.
pub fn font_size(height: u32) -> u32 {
    (height / 24).max(8)
}

/// `drawtext` filter captioning a clip whose first frame was captured at
/// `start`.
pub fn drawtext_filter(start: DateTime<Utc>, height: u32) -> String {
    let size = font_size(height);
    let pad = (size / 4).max(1);
    let inset = pad + (size / 2).max(2);

    format!(
        "drawtext=text='%{{pts\\:gmtime\\:{offset}\\:{format}}}':\
         font=monospace:fontsize={size}:fontcolor=white:\
         box=1:boxcolor=black@0.6:boxborderw={pad}:\
         x={inset}:y=h-th-{inset}",
        offset = gmtime_offset(start),
        format = CAPTION_FORMAT,
        size = size,
        pad = pad,
        inset = inset,
    )
}

/// Unix seconds with millisecond precision, as `drawtext` expects.
fn gmtime_offset(start: DateTime<Utc>) -> String {
    format!("{}.{:03}", start.timestamp(), start.timestamp_subsec_millis())
}
