/// Inclusive byte interval, `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn full(size_bytes: u64) -> Option<Self> {
        size_bytes.checked_sub(1).map(|end| Self { start: 0, end })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub range: ByteRange,
    pub partial: bool,
    pub size_bytes: u64,
}

impl Negotiated {
    pub fn status(&self) -> u16 {
        if self.partial { 206 } else { 200 }
    }

    pub fn content_length(&self) -> u64 {
        self.range.len()
    }

    pub fn content_range(&self) -> Option<String> {
        self.partial.then(|| {
            format!(
                "bytes {}-{}/{}",
                self.range.start, self.range.end, self.size_bytes
            )
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("range not satisfiable for {size_bytes} bytes")]
    Unsatisfiable { size_bytes: u64 },

    /// The object has no bytes and no range was asked for.
    #[error("empty object")]
    Empty,
}

impl RangeError {
    /// `Content-Range` value for a 416 response.
    pub fn content_range(&self) -> Option<String> {
        match self {
            Self::Unsatisfiable { size_bytes } => Some(format!("bytes */{size_bytes}")),
            Self::Empty => None,
        }
    }
}

enum RangeSpec {
    From { start: u64, end: Option<u64> },
    Suffix(u64),
}

fn parse_range_spec(header: &str) -> Option<RangeSpec> {
    let spec = header.trim().strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None;
    }
    let (first, last) = spec.split_once('-')?;
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        return last.parse().ok().map(RangeSpec::Suffix);
    }

    let start = first.parse().ok()?;
    let end = if last.is_empty() {
        None
    } else {
        Some(last.parse().ok()?)
    };
    Some(RangeSpec::From { start, end })
}

/// Turns an optional `Range` header into the interval to serve.
///
/// A missing or unparseable header selects the whole object. `bytes=<start>-[<end>]` and
/// suffix `bytes=-<n>` forms are honored; an end past the object is clamped, a start past
/// it is unsatisfiable.
pub fn negotiate(range_header: Option<&str>, size_bytes: u64) -> Result<Negotiated, RangeError> {
    let whole = |range| Negotiated {
        range,
        partial: false,
        size_bytes,
    };

    let spec = match range_header.and_then(parse_range_spec) {
        Some(RangeSpec::From { start, end }) if end.is_some_and(|end| end < start) => None,
        other => other,
    };

    let Some(spec) = spec else {
        return ByteRange::full(size_bytes).map(whole).ok_or(RangeError::Empty);
    };

    let unsatisfiable = RangeError::Unsatisfiable { size_bytes };
    let last = size_bytes.checked_sub(1).ok_or(unsatisfiable)?;

    let range = match spec {
        RangeSpec::From { start, end } => {
            if start > last {
                return Err(unsatisfiable);
            }
            ByteRange {
                start,
                end: end.map_or(last, |end| end.min(last)),
            }
        }
        RangeSpec::Suffix(0) => return Err(unsatisfiable),
        RangeSpec::Suffix(n) => ByteRange {
            start: size_bytes.saturating_sub(n),
            end: last,
        },
    };

    Ok(Negotiated {
        range,
        partial: range.start != 0 || range.end != last,
        size_bytes,
    })
}
