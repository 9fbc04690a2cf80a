/// Inclusive byte span selected by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive
    pub end: u64,
    /// A usable `Range` header was present, so the answer is 206
    pub partial: bool,
}

impl ByteRange {
    pub fn full(total: u64) -> Self {
        Self {
            start: 0,
            end: total.saturating_sub(1),
            partial: false,
        }
    }

    /// Number of bytes in the span, never zero
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn covers(&self, total: u64) -> bool {
        self.start == 0 && self.end + 1 == total
    }

    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Resolve a `Range` header against an object of `total` bytes.
///
/// Malformed or out-of-bounds values are clamped into `[0, total-1]` rather
/// than rejected; an end before the start serves to the last byte. Only the
/// first range of a multi-range request is honoured, and any unit other
/// than `bytes` is read as bytes. A present header always yields a partial
/// response. Returns `None` only when there is nothing to serve.
pub fn parse_range(header: Option<&str>, total: u64) -> Option<ByteRange> {
    if total == 0 {
        return None;
    }
    let last = total - 1;

    let Some(spec) = header.map(strip_unit) else {
        return Some(ByteRange::full(total));
    };
    let first = spec.split(',').next().unwrap_or("").trim();

    let (start, end) = match first.split_once('-') {
        // bytes=-N: the final N bytes
        Some(("", suffix)) => match suffix.trim().parse::<u64>() {
            Ok(n) => (total - n.clamp(1, total), last),
            Err(_) => (0, last),
        },
        Some((start, end)) => {
            let start = start.trim().parse::<u64>().unwrap_or(0);
            let end = end.trim().parse::<u64>().unwrap_or(last);
            (start, end)
        }
        None => (first.parse::<u64>().unwrap_or(0), last),
    };

    let start = start.min(last);
    let mut end = end.min(last);
    if end < start {
        end = last;
    }

    Some(ByteRange {
        start,
        end,
        partial: true,
    })
}

fn strip_unit(header: &str) -> &str {
    let header = header.trim();
    match header.split_once('=') {
        Some((_, spec)) => spec,
        None => header,
    }
}
