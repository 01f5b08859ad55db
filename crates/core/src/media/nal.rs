//! Annex B NAL unit extraction.
//!
//! H.264 and H.265 elementary streams captured from a device delimit NAL
//! units with start codes:
//!
//! - 4-byte: `0x00 0x00 0x00 0x01`
//! - 3-byte: `0x00 0x00 0x01`
//!
//! [`NalUnits`] walks a capture buffer lazily and yields one [`NalUnit`] per
//! start code. The iterator is finite and restartable per buffer: build a new
//! one for every capture read. Units borrow the caller's buffer and never
//! outlive it.

/// Long (4-byte) Annex B start code.
pub const START_CODE_LONG: [u8; 4] = [0, 0, 0, 1];

/// Short (3-byte) Annex B start code.
pub const START_CODE_SHORT: [u8; 3] = [0, 0, 1];

/// A single NAL unit inside a capture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit<'a> {
    /// Start code followed by the NAL payload.
    raw: &'a [u8],
    marker_len: usize,
    keep_marker: bool,
}

impl<'a> NalUnit<'a> {
    /// The unit as requested by the extractor: with the leading start code
    /// in "keep marker" mode, payload only otherwise.
    pub fn bytes(&self) -> &'a [u8] {
        if self.keep_marker {
            self.raw
        } else {
            self.payload()
        }
    }

    /// NAL payload (header byte onward) without the start code.
    pub fn payload(&self) -> &'a [u8] {
        &self.raw[self.marker_len..]
    }

    /// The start code preceding this unit (3 or 4 bytes).
    pub fn marker(&self) -> &'a [u8] {
        &self.raw[..self.marker_len]
    }

    /// First byte after the start code; codecs derive the NAL type from it.
    pub fn header(&self) -> u8 {
        self.raw[self.marker_len]
    }

    /// Length of [`bytes`](Self::bytes).
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }
}

/// Locate the first start code at or after `from`.
///
/// Returns `(position, start_code_length)`. A 4-byte start code is preferred
/// over the 3-byte code it contains.
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + START_CODE_SHORT.len() <= data.len() {
        if i + START_CODE_LONG.len() <= data.len() && data[i..i + 4] == START_CODE_LONG {
            return Some((i, START_CODE_LONG.len()));
        }
        if data[i..i + 3] == START_CODE_SHORT {
            return Some((i, START_CODE_SHORT.len()));
        }
        i += 1;
    }
    None
}

/// Extract the next NAL unit from `buf`.
///
/// Returns the unit and the unconsumed tail of the buffer, or `None` once no
/// further start code with a payload is found. The unit ends at the next
/// start code (of either length) or at the end of the buffer.
pub fn next_nal_unit(buf: &[u8], keep_marker: bool) -> Option<(NalUnit<'_>, &[u8])> {
    if buf.len() < START_CODE_SHORT.len() {
        if !buf.is_empty() {
            tracing::debug!(len = buf.len(), "buffer shorter than a start code");
        }
        return None;
    }

    let mut from = 0usize;
    loop {
        let (pos, marker_len) = find_start_code(buf, from)?;
        let payload_start = pos + marker_len;
        if payload_start >= buf.len() {
            return None;
        }

        let end = find_start_code(buf, payload_start)
            .map(|(next, _)| next)
            .unwrap_or(buf.len());

        if end == payload_start {
            // back-to-back start codes, nothing between them
            from = end;
            continue;
        }

        let unit = NalUnit {
            raw: &buf[pos..end],
            marker_len,
            keep_marker,
        };
        return Some((unit, &buf[end..]));
    }
}

/// Lazy iterator over the NAL units of one capture buffer.
#[derive(Debug, Clone)]
pub struct NalUnits<'a> {
    remaining: &'a [u8],
    keep_marker: bool,
}

impl<'a> NalUnits<'a> {
    pub fn new(buf: &'a [u8], keep_marker: bool) -> Self {
        Self {
            remaining: buf,
            keep_marker,
        }
    }

    /// Bytes not yet consumed by the iterator.
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = NalUnit<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        match next_nal_unit(self.remaining, self.keep_marker) {
            Some((unit, rest)) => {
                self.remaining = rest;
                Some(unit)
            }
            None => {
                self.remaining = &[];
                None
            }
        }
    }
}

/// Collect the payloads (no start codes) of every NAL unit in `data`.
pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
    NalUnits::new(data, false).map(|nal| nal.payload()).collect()
}

/// Append `nal` to `out` behind a 4-byte start code.
pub fn push_annex_b(out: &mut Vec<u8>, nal: &[u8]) {
    out.extend_from_slice(&START_CODE_LONG);
    out.extend_from_slice(nal);
}

/// Convert NAL payload bytes to RBSP by dropping emulation prevention bytes
/// (`00 00 03` → `00 00`).
pub fn strip_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0usize;
    for &byte in data {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        if byte == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annex_b(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            push_annex_b(&mut out, nal);
        }
        out
    }

    #[test]
    fn yields_exactly_n_units_then_none() {
        let nals: [&[u8]; 4] = [
            &[0x67, 0x64, 0x00, 0x28],
            &[0x68, 0xEE, 0x3C],
            &[0x06, 0x05, 0x10],
            &[0x65, 0x88, 0x84, 0x00, 0x21],
        ];
        let data = annex_b(&nals);

        let mut iter = NalUnits::new(&data, false);
        for expected in nals {
            let unit = iter.next().expect("unit");
            assert_eq!(unit.payload(), expected);
        }
        assert!(iter.next().is_none());
        assert!(iter.next().is_none(), "exhausted iterator stays exhausted");
    }

    #[test]
    fn mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0xAA]);

        let units: Vec<_> = NalUnits::new(&data, false).collect();
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].payload(), &[0x67, 0x42]);
        assert_eq!(units[0].marker_len, 4);
        assert_eq!(units[1].payload(), &[0x68, 0xCE]);
        assert_eq!(units[1].marker(), &START_CODE_SHORT);
        assert_eq!(units[2].header(), 0x65);
    }

    #[test]
    fn keep_marker_includes_start_code() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0, 0, 1, 0x41, 0xBB];
        let units: Vec<_> = NalUnits::new(&data, true).collect();
        assert_eq!(units[0].bytes(), &[0, 0, 0, 1, 0x65, 0xAA]);
        assert_eq!(units[1].bytes(), &[0, 0, 1, 0x41, 0xBB]);
        assert_eq!(units[1].header(), 0x41);
    }

    #[test]
    fn rescanning_kept_marker_matches_payload_with_prepended_marker() {
        let data = annex_b(&[&[0x67, 0x42, 0x00, 0x1E], &[0x68, 0xCE], &[0x65, 0x01, 0x02]]);

        let with_marker: Vec<_> = NalUnits::new(&data, true).collect();
        let without: Vec<_> = NalUnits::new(&data, false).collect();
        assert_eq!(with_marker.len(), without.len());

        for (kept, bare) in with_marker.iter().zip(&without) {
            let rescanned: Vec<_> = NalUnits::new(kept.bytes(), false).collect();
            assert_eq!(rescanned.len(), 1);
            assert_eq!(rescanned[0].payload(), bare.payload());

            let mut manual = bare.marker().to_vec();
            manual.extend_from_slice(bare.payload());
            assert_eq!(kept.bytes(), manual.as_slice());
        }
    }

    #[test]
    fn short_buffer_yields_nothing() {
        assert!(next_nal_unit(&[0, 0], false).is_none());
        assert!(next_nal_unit(&[], false).is_none());
    }

    #[test]
    fn no_start_code() {
        assert!(extract_nal_units(&[0xFF, 0xFE, 0x01, 0x02]).is_empty());
    }

    #[test]
    fn trailing_start_code_without_payload() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0, 0, 0, 1];
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x65u8, 0xAA][..]]);
    }

    #[test]
    fn back_to_back_start_codes_are_skipped() {
        let data = [0, 0, 1, 0, 0, 1, 0x09, 0xF0];
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x09u8, 0xF0][..]]);
    }

    #[test]
    fn leading_garbage_is_ignored() {
        let data = [0xAB, 0xCD, 0, 0, 0, 1, 0x41, 0x9A];
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x41u8, 0x9A][..]]);
    }

    #[test]
    fn emulation_prevention_removed() {
        let data = [0x42, 0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00, 0x03];
        assert_eq!(
            strip_emulation_prevention(&data),
            vec![0x42, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x03]
        );
    }
}
