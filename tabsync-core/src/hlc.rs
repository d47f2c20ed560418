//! Hybrid logical clock.
//!
//! Timestamps are 16-character strings: seven characters of logical time
//! (42 bits, milliseconds), four characters of counter (24 bits) and a
//! five-character replica tag. Each character carries six bits drawn from an
//! alphabet in ASCII order, so comparing two timestamps as strings compares
//! `(logical_time, counter)` numerically.
//!
//! Two replicas that emit the same `(logical_time, counter)` pair differ only
//! in their tags. The tag makes the strings distinct but the resulting order
//! between those two writes carries no causal meaning.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::hash::get_hash;

/// Base-64 alphabet sorted by ASCII code.
const ALPHABET: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

const MASK6: u64 = 63;
const TIME_CHARS: usize = 7;
const COUNTER_CHARS: usize = 4;
const TAG_CHARS: usize = 5;
const MAX_COUNTER: i64 = (1 << 24) - 1;

/// Length of an encoded timestamp.
pub const HLC_LENGTH: usize = TIME_CHARS + COUNTER_CHARS + TAG_CHARS;

/// Source of wall-clock milliseconds.
pub type TimeSource = Arc<dyn Fn() -> u64 + Send + Sync>;

fn encode(num: u64) -> char {
    char::from(ALPHABET[(num & MASK6) as usize])
}

fn decode(hlc: &[u8], pos: usize) -> u64 {
    hlc.get(pos)
        .and_then(|c| ALPHABET.iter().position(|a| a == c))
        .map_or(0, |index| index as u64)
}

fn encode_groups(out: &mut String, num: u64, groups: usize) {
    for group in (0..groups).rev() {
        out.push(encode(num >> (6 * group)));
    }
}

/// Encodes a logical time and counter into the sortable eleven-character prefix.
pub fn encode_time_and_counter(logical_time: u64, counter: u64) -> String {
    let mut out = String::with_capacity(HLC_LENGTH);
    encode_groups(&mut out, logical_time, TIME_CHARS);
    encode_groups(&mut out, counter, COUNTER_CHARS);
    out
}

/// Decodes the logical time and counter from a timestamp.
///
/// Characters outside the alphabet decode as zero.
pub fn decode_time_and_counter(hlc: &str) -> (u64, u64) {
    let bytes = hlc.as_bytes();
    let time = (0..TIME_CHARS).fold(0, |acc, pos| (acc << 6) | decode(bytes, pos));
    let counter = (TIME_CHARS..TIME_CHARS + COUNTER_CHARS)
        .fold(0, |acc, pos| (acc << 6) | decode(bytes, pos));
    (time, counter)
}

/// Generates a random identifier from the timestamp alphabet.
pub fn unique_id(length: usize) -> String {
    (0..length)
        .map(|_| encode(u64::from(rand::random::<u8>())))
        .collect()
}

fn system_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// A hybrid logical clock for one replica.
pub struct Hlc {
    logical_time: u64,
    last_counter: i64,
    tag: String,
    now: TimeSource,
}

impl Hlc {
    /// Creates a clock. A `unique_id` yields a stable tag; otherwise the tag is random.
    pub fn new(unique_id: Option<&str>) -> Self {
        Self::with_time_source(unique_id, Arc::new(system_millis))
    }

    /// Creates a clock reading wall time from `now`.
    pub fn with_time_source(unique_id: Option<&str>, now: TimeSource) -> Self {
        let tag = match unique_id {
            Some(id) => {
                let mut tag = String::with_capacity(TAG_CHARS);
                encode_groups(&mut tag, u64::from(get_hash(id)), TAG_CHARS);
                tag
            }
            None => self::unique_id(TAG_CHARS),
        };
        Self {
            logical_time: 0,
            last_counter: -1,
            tag,
            now,
        }
    }

    /// The five-character replica tag appended to every timestamp.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns a timestamp strictly greater than any previously returned or seen.
    pub fn next(&mut self) -> String {
        self.seen(None);
        if self.last_counter >= MAX_COUNTER {
            self.logical_time += 1;
            self.last_counter = -1;
        }
        self.last_counter += 1;
        let mut hlc = encode_time_and_counter(self.logical_time, self.last_counter as u64);
        hlc.push_str(&self.tag);
        hlc
    }

    /// Folds a local or foreign timestamp (or just the wall clock) into the clock.
    pub fn seen(&mut self, hlc: Option<&str>) {
        let previous = self.logical_time;
        let (remote_time, remote_counter) = match hlc {
            Some(hlc) if !hlc.is_empty() => decode_time_and_counter(hlc),
            _ => (0, 0),
        };
        let remote_counter = remote_counter as i64;

        self.logical_time = previous.max(remote_time).max((self.now)());
        self.last_counter = if self.logical_time == previous {
            if self.logical_time == remote_time {
                self.last_counter.max(remote_counter)
            } else {
                self.last_counter
            }
        } else if self.logical_time == remote_time {
            remote_counter
        } else {
            -1
        };
    }
}

impl fmt::Debug for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hlc")
            .field("logical_time", &self.logical_time)
            .field("last_counter", &self.last_counter)
            .field("tag", &self.tag)
            .finish()
    }
}
