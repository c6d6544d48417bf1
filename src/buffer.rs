//! Byte buffer primitives shared by the framers.
//!
//! All helpers are total: out-of-range positions are clamped and degenerate
//! inputs produce empty results instead of panicking. Positions that may
//! legitimately be negative (window arithmetic done by callers) are taken
//! as `isize`.

/// Bounded slice of `buf` starting at `start` and spanning `length` bytes.
///
/// A negative `start` extends the window from the left, so `slice(b"abcdef", -2, 5)`
/// yields `b"abc"`. A negative `length` is treated as zero.
pub fn slice(buf: &[u8], start: isize, length: isize) -> &[u8] {
    let len = buf.len() as isize;
    let end = start.saturating_add(length.max(0)).min(len);
    let start = start.max(0);
    if start >= end {
        return &[];
    }
    &buf[start as usize..end as usize]
}

/// Applies [`slice`] to every `(start, length)` pair.
pub fn slice_multi<'a>(buf: &'a [u8], ranges: &[(isize, isize)]) -> Vec<&'a [u8]> {
    ranges
        .iter()
        .map(|&(start, length)| slice(buf, start, length))
        .collect()
}

/// End indexes (inclusive) of the matches of `needle` in `haystack`.
///
/// Only the first `limit` bytes are scanned. A match is recorded only when its
/// end lies at least `min_step` bytes after the previously recorded one;
/// `min_step` is raised to the needle length, so runs of repeated terminator
/// bytes never produce overlapping hits. Scanning starts at `offset`.
pub fn find_occurrences(
    haystack: &[u8],
    needle: &[u8],
    limit: Option<usize>,
    min_step: usize,
    offset: usize,
) -> Vec<usize> {
    let mut found = Vec::new();
    if haystack.is_empty() || needle.is_empty() {
        return found;
    }

    let min_step = min_step.max(needle.len());
    let scan_len = limit.map_or(haystack.len(), |l| l.min(haystack.len()));
    if scan_len < needle.len() {
        return found;
    }

    let mut last: Option<usize> = None;
    for start in offset..=scan_len - needle.len() {
        if &haystack[start..start + needle.len()] != needle {
            continue;
        }
        let end = start + needle.len() - 1;
        if last.map_or(true, |prev| end - prev >= min_step) {
            found.push(end);
            last = Some(end);
        }
    }
    found
}

/// End index (inclusive) of the first match of `needle` at or after `offset`
/// within the first `limit` bytes.
pub fn find_first_occurrence(
    haystack: &[u8],
    needle: &[u8],
    limit: Option<usize>,
    offset: usize,
) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let scan_len = limit.map_or(haystack.len(), |l| l.min(haystack.len()));
    let window = haystack.get(offset..scan_len)?;
    window
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| offset + pos + needle.len() - 1)
}

/// Turns a set of end positions into the inclusive `(start, end)` intervals
/// between them.
///
/// Positions are sorted and de-duplicated first. The first interval starts at
/// 0. Each interval is trimmed by `skip_start` at the front and `skip_end` at
/// the back; intervals that become empty are dropped.
pub fn get_intervals(indexes: &[usize], skip_start: usize, skip_end: usize) -> Vec<(usize, usize)> {
    let mut sorted = indexes.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut intervals = Vec::with_capacity(sorted.len());
    let mut prev: Option<usize> = None;
    for &current in &sorted {
        let start = prev.map_or(0, |p| p + 1) + skip_start;
        if let Some(end) = current.checked_sub(skip_end) {
            if start <= end {
                intervals.push((start, end));
            }
        }
        prev = Some(current);
    }
    intervals
}

/// Clamps a copy request to what both buffers can hold.
///
/// Returns `(src_start, dst_start, count)`, or `None` when nothing can be copied.
fn copy_window(
    src_len: usize,
    dst_len: usize,
    src_start: isize,
    dst_start: isize,
    max_count: Option<usize>,
) -> Option<(usize, usize, usize)> {
    let src_start = src_start.max(0) as usize;
    let dst_start = dst_start.max(0) as usize;
    if src_start >= src_len || dst_start >= dst_len {
        return None;
    }
    let count = (src_len - src_start)
        .min(dst_len - dst_start)
        .min(max_count.unwrap_or(usize::MAX));
    (count > 0).then_some((src_start, dst_start, count))
}

/// Copies bytes from `src[src_start..]` into `dst[dst_start..]`.
///
/// At most `max_count` bytes are copied, bounded by both buffers. Negative
/// starts are clamped to 0. Returns the number of bytes copied.
pub fn replace_with(
    dst: &mut [u8],
    src: &[u8],
    src_start: isize,
    dst_start: isize,
    max_count: Option<usize>,
) -> usize {
    match copy_window(src.len(), dst.len(), src_start, dst_start, max_count) {
        Some((s, d, count)) => {
            dst[d..d + count].copy_from_slice(&src[s..s + count]);
            count
        }
        None => 0,
    }
}

/// [`replace_with`] where source and destination are the same buffer.
///
/// Overlapping ranges are handled like `memmove`, which makes this the
/// compaction primitive for accumulation buffers.
pub fn move_within(
    buf: &mut [u8],
    src_start: isize,
    dst_start: isize,
    max_count: Option<usize>,
) -> usize {
    match copy_window(buf.len(), buf.len(), src_start, dst_start, max_count) {
        Some((s, d, count)) => {
            buf.copy_within(s..s + count, d);
            count
        }
        None => 0,
    }
}

/// Concatenates two buffers into a new one.
pub fn append(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    out
}

/// Everything in `haystack[..limit]` after the first match of `needle`.
///
/// With `include_needle` the match itself is part of the result.
pub fn get_after<'a>(
    haystack: &'a [u8],
    needle: &[u8],
    include_needle: bool,
    limit: Option<usize>,
) -> &'a [u8] {
    let end = limit.map_or(haystack.len(), |l| l.min(haystack.len()));
    match find_first_occurrence(haystack, needle, Some(end), 0) {
        Some(match_end) => {
            let start = if include_needle {
                match_end + 1 - needle.len()
            } else {
                match_end + 1
            };
            &haystack[start..end]
        }
        None => &[],
    }
}
