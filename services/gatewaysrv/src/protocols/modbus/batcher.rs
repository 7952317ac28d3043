//! Read batching
//!
//! Groups requested address ranges into contiguous read spans per
//! (unit id, function code). Ranges that overlap or touch are merged while the
//! merged span stays within the configured maximum; otherwise a new span
//! starts where the previous one ended. Values are decoded from the assembled
//! [`RegisterImage`], so a value straddling two spans still decodes.

use std::collections::{BTreeMap, HashMap};

use super::constants::{is_bit_function, DEFAULT_MAX_READ_BITS, DEFAULT_MAX_READ_REGISTERS};

/// Address range requested for one data point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub unit_id: u8,
    pub function_code: u8,
    pub start: u16,
    pub count: u16,
}

/// One physical read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadSpan {
    pub unit_id: u8,
    pub function_code: u8,
    pub start: u16,
    pub count: u16,
}

impl ReadSpan {
    /// Exclusive end address
    pub fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.count)
    }
}

/// Span limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// FC03/FC04 span limit in registers
    pub max_registers: u16,
    /// FC01/FC02 span limit in bits
    pub max_bits: u16,
    /// Holes up to this size are read through instead of splitting
    pub max_gap: u16,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_registers: DEFAULT_MAX_READ_REGISTERS,
            max_bits: DEFAULT_MAX_READ_BITS,
            max_gap: 0,
        }
    }
}

impl BatchLimits {
    fn max_for(&self, function_code: u8) -> u32 {
        let max = if is_bit_function(function_code) {
            self.max_bits
        } else {
            self.max_registers
        };
        u32::from(max.max(1))
    }
}

/// Plan the read spans covering every request, sorted by (unit, fc, start)
pub fn plan_spans(requests: &[ReadRequest], limits: &BatchLimits) -> Vec<ReadSpan> {
    let mut groups: BTreeMap<(u8, u8), Vec<(u32, u32)>> = BTreeMap::new();
    for req in requests.iter().filter(|r| r.count > 0) {
        let start = u32::from(req.start);
        let end = (start + u32::from(req.count)).min(0x1_0000);
        groups
            .entry((req.unit_id, req.function_code))
            .or_default()
            .push((start, end));
    }

    let mut spans = Vec::new();
    for ((unit_id, function_code), mut ranges) in groups {
        ranges.sort_unstable();
        let max = limits.max_for(function_code);
        let gap = u32::from(limits.max_gap);

        let mut emit = |start: u32, end: u32| {
            spans.push(ReadSpan {
                unit_id,
                function_code,
                start: start as u16,
                count: (end - start) as u16,
            });
        };

        let mut current: Option<(u32, u32)> = None;
        for (start, end) in ranges {
            current = match current {
                None => Some((start, end)),
                Some((cs, ce)) if start <= ce + gap => {
                    let merged_end = ce.max(end);
                    if merged_end - cs <= max {
                        Some((cs, merged_end))
                    } else {
                        emit(cs, ce);
                        let next = start.max(ce);
                        (end > next).then_some((next, end))
                    }
                },
                Some((cs, ce)) => {
                    emit(cs, ce);
                    Some((start, end))
                },
            };

            // A single range longer than the limit is read in chunks
            while let Some((cs, ce)) = current {
                if ce - cs <= max {
                    break;
                }
                emit(cs, cs + max);
                current = Some((cs + max, ce));
            }
        }
        if let Some((cs, ce)) = current {
            emit(cs, ce);
        }
    }
    spans
}

/// Register words (or bits) collected during one read cycle
#[derive(Debug, Default, Clone)]
pub struct RegisterImage {
    words: HashMap<(u8, u8, u16), u16>,
}

impl RegisterImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the response of one span
    pub fn insert_span(&mut self, span: &ReadSpan, words: &[u16]) {
        for (i, word) in words.iter().take(span.count as usize).enumerate() {
            let address = span.start.wrapping_add(i as u16);
            self.words
                .insert((span.unit_id, span.function_code, address), *word);
        }
    }

    /// Words for a value, or `None` if any register was not read
    pub fn get(&self, unit_id: u8, function_code: u8, start: u16, count: u16) -> Option<Vec<u16>> {
        (0..count)
            .map(|i| {
                self.words
                    .get(&(unit_id, function_code, start.wrapping_add(i)))
                    .copied()
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn req(function_code: u8, start: u16, count: u16) -> ReadRequest {
        ReadRequest {
            unit_id: 1,
            function_code,
            start,
            count,
        }
    }

    fn covered(spans: &[ReadSpan], function_code: u8) -> BTreeSet<u32> {
        spans
            .iter()
            .filter(|s| s.function_code == function_code)
            .flat_map(|s| u32::from(s.start)..s.end())
            .collect()
    }

    fn requested(requests: &[ReadRequest], function_code: u8) -> BTreeSet<u32> {
        requests
            .iter()
            .filter(|r| r.function_code == function_code)
            .flat_map(|r| u32::from(r.start)..u32::from(r.start) + u32::from(r.count))
            .collect()
    }

    fn assert_span_properties(requests: &[ReadRequest], limits: &BatchLimits) {
        let spans = plan_spans(requests, limits);
        for fc in 1..=4u8 {
            assert_eq!(covered(&spans, fc), requested(requests, fc), "fc {}", fc);
        }
        for pair in spans.windows(2) {
            if (pair[0].unit_id, pair[0].function_code) == (pair[1].unit_id, pair[1].function_code)
            {
                assert!(pair[0].end() <= u32::from(pair[1].start), "{:?}", pair);
            } else {
                assert!(
                    (pair[0].unit_id, pair[0].function_code)
                        < (pair[1].unit_id, pair[1].function_code)
                );
            }
        }
        for span in &spans {
            let max = if span.function_code <= 2 {
                limits.max_bits
            } else {
                limits.max_registers
            };
            assert!(span.count >= 1 && span.count <= max, "{:?}", span);
        }
    }

    #[test]
    fn test_adjacent_ranges_merge() {
        let requests = [req(3, 100, 2), req(3, 102, 1), req(3, 103, 4)];
        let spans = plan_spans(&requests, &BatchLimits::default());
        assert_eq!(spans.len(), 1);
        assert_eq!((spans[0].start, spans[0].count), (100, 7));
    }

    #[test]
    fn test_gap_splits_by_default() {
        let requests = [req(3, 0, 1), req(3, 5, 1)];
        let spans = plan_spans(&requests, &BatchLimits::default());
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn test_gap_bridged_when_configured() {
        let requests = [req(3, 0, 1), req(3, 5, 1)];
        let limits = BatchLimits {
            max_gap: 10,
            ..Default::default()
        };
        let spans = plan_spans(&requests, &limits);
        assert_eq!(spans.len(), 1);
        assert_eq!((spans[0].start, spans[0].count), (0, 6));
    }

    #[test]
    fn test_max_span_starts_new_group() {
        let limits = BatchLimits {
            max_registers: 10,
            ..Default::default()
        };
        let requests = [req(3, 0, 6), req(3, 6, 6)];
        let spans = plan_spans(&requests, &limits);
        assert_eq!(spans.len(), 2);
        assert_eq!((spans[0].start, spans[0].count), (0, 6));
        assert_eq!((spans[1].start, spans[1].count), (6, 6));
    }

    #[test]
    fn test_overlap_beyond_max_continues_after_previous_span() {
        let limits = BatchLimits {
            max_registers: 4,
            ..Default::default()
        };
        let requests = [req(3, 0, 3), req(3, 2, 4)];
        let spans = plan_spans(&requests, &limits);
        assert_eq!(spans.len(), 2);
        assert_eq!((spans[0].start, spans[0].count), (0, 3));
        assert_eq!((spans[1].start, spans[1].count), (3, 3));
        assert_span_properties(&requests, &limits);
    }

    #[test]
    fn test_function_codes_never_mix() {
        let requests = [req(3, 0, 1), req(4, 1, 1), req(1, 0, 8)];
        let spans = plan_spans(&requests, &BatchLimits::default());
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].function_code, 1);
        assert_eq!(spans[1].function_code, 3);
        assert_eq!(spans[2].function_code, 4);
    }

    #[test]
    fn test_coil_limit() {
        let requests: Vec<_> = (0..2500u16).map(|a| req(1, a, 1)).collect();
        let spans = plan_spans(&requests, &BatchLimits::default());
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].count, 2000);
        assert_eq!(spans[1].count, 500);
    }

    #[test]
    fn test_register_default_limit() {
        let requests: Vec<_> = (0..130u16).map(|a| req(3, 40000 + a * 2, 2)).collect();
        let spans = plan_spans(&requests, &BatchLimits::default());
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].count, 120);
        assert_span_properties(&requests, &BatchLimits::default());
    }

    #[test]
    fn test_pseudo_random_request_sets() {
        // Small LCG keeps the case list deterministic
        let mut seed: u32 = 0x1234_5678;
        let mut next = |bound: u32| {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (seed >> 8) % bound
        };
        for round in 0..200 {
            let limits = BatchLimits {
                max_registers: 1 + next(20) as u16,
                max_bits: 1 + next(40) as u16,
                max_gap: 0,
            };
            let requests: Vec<_> = (0..1 + next(25))
                .map(|_| {
                    let fc = 1 + next(4) as u8;
                    let count = if fc <= 2 { 1 } else { 1 + next(6) as u16 };
                    req(fc, next(200) as u16, count)
                })
                .collect();
            let spans = plan_spans(&requests, &limits);
            assert!(!spans.is_empty(), "round {}", round);
            assert_span_properties(&requests, &limits);
        }
    }

    #[test]
    fn test_register_image_straddling_value() {
        let limits = BatchLimits {
            max_registers: 4,
            ..Default::default()
        };
        let requests = [req(3, 0, 3), req(3, 2, 4)];
        let spans = plan_spans(&requests, &limits);

        let mut image = RegisterImage::new();
        for span in &spans {
            let words: Vec<u16> = (span.start..span.start + span.count).collect();
            image.insert_span(span, &words);
        }
        assert_eq!(image.get(1, 3, 2, 4), Some(vec![2, 3, 4, 5]));
        assert_eq!(image.get(1, 3, 5, 2), None);
        assert_eq!(image.get(2, 3, 0, 1), None);
    }
}
