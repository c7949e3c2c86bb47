//! Stop-string scanning for text that arrives in pieces.

use crate::prompt::text::find_stop_position;

/// Result of scanning not-yet-sent text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split<'a> {
    /// Safe to send now.
    pub releasable: &'a str,
    /// Might be the start of a stop string; wait for more text.
    pub pending: &'a str,
    /// A complete stop string was found; nothing after `releasable` may be sent.
    pub stopped: bool,
}

/// Splits `buffer` into what can be sent and what must wait.
///
/// A complete stop string cuts the buffer at its first occurrence. Otherwise
/// the longest suffix that is a proper prefix of some stop string is held
/// back.
pub fn hold_back<'a>(buffer: &'a str, stops: &[String]) -> Split<'a> {
    if let Some(pos) = find_stop_position(buffer, stops) {
        return Split {
            releasable: &buffer[..pos],
            pending: "",
            stopped: true,
        };
    }

    let longest_stop = stops.iter().map(String::len).max().unwrap_or(0);
    let window_start = buffer.len().saturating_sub(longest_stop);
    let held_from = buffer
        .char_indices()
        .map(|(index, _)| index)
        .filter(|&index| index >= window_start)
        .find(|&index| {
            let tail = &buffer[index..];
            stops
                .iter()
                .any(|stop| stop.len() > tail.len() && stop.starts_with(tail))
        })
        .unwrap_or(buffer.len());

    Split {
        releasable: &buffer[..held_from],
        pending: &buffer[held_from..],
        stopped: false,
    }
}
