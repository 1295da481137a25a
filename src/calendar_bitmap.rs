//! Per-day service bitmaps over explicit date intervals.

use std::fmt;

use chrono::{Datelike, NaiveDate};

use crate::feed::{CalendarEntry, CalendarException, ExceptionType};

const WORD_BITS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BitmapError {
    #[error("Interval start {start} is after its end {end}")]
    InvertedInterval { start: NaiveDate, end: NaiveDate },

    #[error("Cannot extend bitmap over {from} to {to}: the new interval does not contain the old one")]
    NotContained { from: DateInterval, to: DateInterval },

    #[error("Bitmap intervals differ: {left} vs {right}")]
    IntervalMismatch { left: DateInterval, right: DateInterval },

    #[error("Interval {interval} has {expected} days but {actual} bits were given")]
    LengthMismatch {
        interval: DateInterval,
        expected: usize,
        actual: usize,
    },

    #[error("Empty bit string")]
    EmptyBitString,

    #[error("Invalid bit {0:?} in bit string")]
    InvalidBit(char),

    #[error("Invalid service date {0:?}")]
    InvalidDate(String),

    #[error("{days} days from {start} run past the last representable date")]
    DateOutOfRange { start: NaiveDate, days: usize },
}

pub type Result<T> = std::result::Result<T, BitmapError>;

/// Accepts both ISO dates and the compact GTFS `YYYYMMDD` form.
pub fn parse_service_date(value: &str) -> Result<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y%m%d"))
        .map_err(|_| BitmapError::InvalidDate(value.to_string()))
}

/// Inclusive range of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateInterval {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateInterval {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(BitmapError::InvertedInterval { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single_day(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn day_count(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn contains(&self, other: &DateInterval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Smallest interval covering both, including any gap between them.
    pub fn union(&self, other: &DateInterval) -> DateInterval {
        DateInterval {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn intersection(&self, other: &DateInterval) -> Option<DateInterval> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(DateInterval { start, end })
    }

    fn offset_of(&self, date: NaiveDate) -> Option<usize> {
        self.contains_date(date)
            .then(|| (date - self.start).num_days() as usize)
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let start = self.start;
        (0..self.day_count()).map(move |offset| start + chrono::Days::new(offset as u64))
    }
}

impl fmt::Display for DateInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Which days of an interval a service runs on (or, for a cancellation, which
/// days are cancelled). The bit count always equals the interval's day count.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DayBitmap {
    interval: DateInterval,
    words: Vec<u64>,
}

impl DayBitmap {
    pub fn filled(interval: DateInterval, value: bool) -> Self {
        let word_count = interval.day_count().div_ceil(WORD_BITS);
        let fill = if value { u64::MAX } else { 0 };
        let mut bitmap = Self {
            interval,
            words: vec![fill; word_count],
        };
        bitmap.clear_tail();
        bitmap
    }

    pub fn from_bits(interval: DateInterval, bits: &[bool]) -> Result<Self> {
        if bits.len() != interval.day_count() {
            return Err(BitmapError::LengthMismatch {
                interval,
                expected: interval.day_count(),
                actual: bits.len(),
            });
        }
        let mut bitmap = Self::filled(interval, false);
        for (offset, bit) in bits.iter().enumerate() {
            bitmap.set(offset, *bit);
        }
        Ok(bitmap)
    }

    /// Parses bitmaps written as `"1101..."`, one character per day starting at `start`.
    pub fn from_bit_string(start: NaiveDate, bits: &str) -> Result<Self> {
        let bits = bits
            .chars()
            .map(|c| match c {
                '1' => Ok(true),
                '0' => Ok(false),
                other => Err(BitmapError::InvalidBit(other)),
            })
            .collect::<Result<Vec<_>>>()?;
        if bits.is_empty() {
            return Err(BitmapError::EmptyBitString);
        }
        let end = start
            .checked_add_days(chrono::Days::new(bits.len() as u64 - 1))
            .ok_or(BitmapError::DateOutOfRange {
                start,
                days: bits.len(),
            })?;
        Self::from_bits(DateInterval::new(start, end)?, &bits)
    }

    /// Expands a weekly calendar entry and its exceptions into a bitmap.
    ///
    /// Added dates outside the entry's range widen the interval; removed dates
    /// outside of it are ignored.
    pub fn from_calendar<'a>(
        entry: &CalendarEntry,
        exceptions: impl IntoIterator<Item = &'a CalendarException>,
    ) -> Result<Self> {
        let range = DateInterval::new(
            parse_service_date(&entry.start_date)?,
            parse_service_date(&entry.end_date)?,
        )?;
        let mut changes = vec![];
        for exception in exceptions {
            if exception.service_id == entry.service_id {
                changes.push((parse_service_date(&exception.date)?, exception.exception_type));
            }
        }

        let interval = changes
            .iter()
            .filter(|(_, kind)| *kind == ExceptionType::Added)
            .fold(range, |acc, (date, _)| acc.union(&DateInterval::single_day(*date)));

        let weekdays = entry.weekdays();
        let mut bitmap = Self::filled(interval, false);
        for (offset, day) in interval.days().enumerate() {
            let runs = range.contains_date(day)
                && weekdays[day.weekday().num_days_from_monday() as usize];
            bitmap.set(offset, runs);
        }
        for (date, kind) in changes {
            if let Some(offset) = interval.offset_of(date) {
                bitmap.set(offset, kind == ExceptionType::Added);
            }
        }
        Ok(bitmap)
    }

    pub fn interval(&self) -> DateInterval {
        self.interval
    }

    pub fn len(&self) -> usize {
        self.interval.day_count()
    }

    fn get(&self, offset: usize) -> bool {
        self.words[offset / WORD_BITS] & (1 << (offset % WORD_BITS)) != 0
    }

    fn set(&mut self, offset: usize, value: bool) {
        let word = &mut self.words[offset / WORD_BITS];
        let mask = 1 << (offset % WORD_BITS);
        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }

    // Bits past the last day must stay zero for `has_any_set` and equality.
    fn clear_tail(&mut self) {
        let used = self.len() % WORD_BITS;
        if used != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << used) - 1;
            }
        }
    }

    pub fn is_set(&self, date: NaiveDate) -> bool {
        self.interval
            .offset_of(date)
            .is_some_and(|offset| self.get(offset))
    }

    pub fn has_any_set(&self) -> bool {
        self.words.iter().any(|word| *word != 0)
    }

    pub fn count_set(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    pub fn active_days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.interval
            .days()
            .enumerate()
            .filter(|(offset, _)| self.get(*offset))
            .map(|(_, day)| day)
    }

    /// Widens the bitmap; days that were not covered before take `pad`.
    pub fn extend_to(&self, interval: DateInterval, pad: bool) -> Result<Self> {
        if !interval.contains(&self.interval) {
            return Err(BitmapError::NotContained {
                from: self.interval,
                to: interval,
            });
        }
        Ok(self.reframe(interval, pad))
    }

    /// Moves the bitmap onto `interval`, dropping days outside of it and
    /// filling newly covered days with `pad`.
    pub fn reframe(&self, interval: DateInterval, pad: bool) -> Self {
        let mut result = Self::filled(interval, pad);
        if let Some(overlap) = self.interval.intersection(&interval) {
            for day in overlap.days() {
                if let (Some(from), Some(to)) =
                    (self.interval.offset_of(day), interval.offset_of(day))
                {
                    result.set(to, self.get(from));
                }
            }
        }
        result
    }

    pub fn and(&self, other: &DayBitmap) -> Result<Self> {
        if self.interval != other.interval {
            return Err(BitmapError::IntervalMismatch {
                left: self.interval,
                right: other.interval,
            });
        }
        Ok(Self {
            interval: self.interval,
            words: self
                .words
                .iter()
                .zip(&other.words)
                .map(|(a, b)| a & b)
                .collect(),
        })
    }

    pub fn not(&self) -> Self {
        let mut result = Self {
            interval: self.interval,
            words: self.words.iter().map(|word| !word).collect(),
        };
        result.clear_tail();
        result
    }

    /// Removes the days set in `cancellation` from this bitmap.
    ///
    /// Only days inside this bitmap's own interval can be affected. Returns
    /// `None` when no service day is left.
    pub fn cancel(&self, cancellation: &DayBitmap) -> Result<Option<Self>> {
        let aligned = if self.interval.contains(&cancellation.interval) {
            cancellation.extend_to(self.interval, false)?
        } else {
            cancellation.reframe(self.interval, false)
        };
        let remaining = self.and(&aligned.not())?;
        Ok(remaining.has_any_set().then_some(remaining))
    }
}

impl fmt::Display for DayBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.interval)?;
        for offset in 0..self.len() {
            f.write_str(if self.get(offset) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn interval(start: NaiveDate, end: NaiveDate) -> DateInterval {
        DateInterval::new(start, end).unwrap()
    }

    #[test]
    fn test_interval_day_count_and_union() {
        let january = interval(date(2024, 1, 1), date(2024, 1, 31));
        assert_eq!(january.day_count(), 31);
        let march = interval(date(2024, 3, 1), date(2024, 3, 2));
        let hull = january.union(&march);
        assert_eq!(hull.start(), date(2024, 1, 1));
        assert_eq!(hull.end(), date(2024, 3, 2));
        assert_eq!(january.intersection(&march), None);
        assert!(DateInterval::new(date(2024, 1, 2), date(2024, 1, 1)).is_err());
    }

    #[test]
    fn test_cancel_single_day() {
        let message = DayBitmap::from_bit_string(date(2024, 1, 1), "1111111111").unwrap();
        let cancellation = DayBitmap::from_bit_string(date(2024, 1, 5), "1").unwrap();

        let remaining = message.cancel(&cancellation).unwrap().unwrap();

        assert_eq!(remaining.interval(), message.interval());
        assert!(!remaining.is_set(date(2024, 1, 5)));
        assert_eq!(remaining.count_set(), 9);
        for day in message.interval().days().filter(|d| *d != date(2024, 1, 5)) {
            assert!(remaining.is_set(day));
        }
    }

    #[test]
    fn test_cancel_everything_drops_message() {
        let message = DayBitmap::from_bit_string(date(2024, 1, 1), "111").unwrap();
        let cancellation = DayBitmap::from_bit_string(date(2024, 1, 1), "111").unwrap();
        assert_eq!(message.cancel(&cancellation).unwrap(), None);
    }

    #[test]
    fn test_wider_cancellation_only_touches_message_days() {
        let message = DayBitmap::from_bit_string(date(2024, 1, 3), "101").unwrap();
        let cancellation = DayBitmap::from_bit_string(date(2024, 1, 1), "0010000").unwrap();

        let remaining = message.cancel(&cancellation).unwrap().unwrap();

        assert_eq!(remaining.interval(), message.interval());
        assert_eq!(remaining.to_string(), "2024-01-03..2024-01-05 001");
    }

    #[test]
    fn test_disjoint_cancellation_changes_nothing() {
        let message = DayBitmap::from_bit_string(date(2024, 1, 1), "110").unwrap();
        let cancellation = DayBitmap::from_bit_string(date(2024, 2, 1), "111").unwrap();
        assert_eq!(message.cancel(&cancellation).unwrap(), Some(message));
    }

    #[test]
    fn test_cancellation_result_is_subset() {
        let message =
            DayBitmap::from_bit_string(date(2024, 1, 1), "1011001110100111010110").unwrap();
        let cancellation = DayBitmap::from_bit_string(date(2023, 12, 28), "0110101001011").unwrap();
        if let Some(remaining) = message.cancel(&cancellation).unwrap() {
            for day in remaining.active_days() {
                assert!(message.is_set(day));
            }
        }
    }

    #[test]
    fn test_extend_keeps_bits_and_pads() {
        let bitmap = DayBitmap::from_bit_string(date(2024, 1, 2), "101").unwrap();
        let wider = interval(date(2024, 1, 1), date(2024, 1, 6));

        let padded_off = bitmap.extend_to(wider, false).unwrap();
        assert_eq!(padded_off.to_string(), "2024-01-01..2024-01-06 010100");
        let padded_on = bitmap.extend_to(wider, true).unwrap();
        assert_eq!(padded_on.to_string(), "2024-01-01..2024-01-06 110111");

        for day in bitmap.active_days() {
            assert!(padded_off.is_set(day));
        }
    }

    #[test]
    fn test_extend_to_smaller_interval_fails() {
        let bitmap = DayBitmap::from_bit_string(date(2024, 1, 1), "1111").unwrap();
        let smaller = interval(date(2024, 1, 2), date(2024, 1, 3));
        assert!(matches!(
            bitmap.extend_to(smaller, false),
            Err(BitmapError::NotContained { .. })
        ));
    }

    #[test]
    fn test_and_requires_equal_intervals() {
        let a = DayBitmap::from_bit_string(date(2024, 1, 1), "11").unwrap();
        let b = DayBitmap::from_bit_string(date(2024, 1, 2), "11").unwrap();
        assert!(matches!(a.and(&b), Err(BitmapError::IntervalMismatch { .. })));

        let c = DayBitmap::from_bit_string(date(2024, 1, 1), "01").unwrap();
        assert_eq!(a.and(&c).unwrap(), c);
    }

    #[test]
    fn test_not_over_word_boundary() {
        let start = date(2024, 1, 1);
        let bitmap = DayBitmap::filled(interval(start, date(2024, 3, 10)), false);
        let inverted = bitmap.not();
        assert_eq!(inverted.count_set(), bitmap.len());
        assert!(!inverted.not().has_any_set());
    }

    #[test]
    fn test_invalid_bit_strings() {
        let start = date(2024, 1, 1);
        assert_eq!(DayBitmap::from_bit_string(start, ""), Err(BitmapError::EmptyBitString));
        assert_eq!(DayBitmap::from_bit_string(start, "10x"), Err(BitmapError::InvalidBit('x')));
    }

    #[test]
    fn test_bit_string_past_last_date_fails() {
        assert_eq!(
            DayBitmap::from_bit_string(NaiveDate::MAX, "11"),
            Err(BitmapError::DateOutOfRange {
                start: NaiveDate::MAX,
                days: 2,
            })
        );
        let last_day = DayBitmap::from_bit_string(NaiveDate::MAX, "1").unwrap();
        assert!(last_day.is_set(NaiveDate::MAX));
        assert_eq!(last_day.active_days().collect::<Vec<_>>(), [NaiveDate::MAX]);
    }

    #[test]
    fn test_from_calendar() {
        let entry = CalendarEntry {
            service_id: "workdays".into(),
            monday: true,
            tuesday: true,
            wednesday: true,
            thursday: true,
            friday: true,
            saturday: false,
            sunday: false,
            start_date: "2024-01-01".into(),
            end_date: "20240107".into(),
        };
        let exceptions = [
            CalendarException {
                service_id: "workdays".into(),
                date: "2024-01-01".into(),
                exception_type: ExceptionType::Removed,
            },
            CalendarException {
                service_id: "workdays".into(),
                date: "2024-01-09".into(),
                exception_type: ExceptionType::Added,
            },
            CalendarException {
                service_id: "other".into(),
                date: "2024-01-06".into(),
                exception_type: ExceptionType::Added,
            },
        ];

        let bitmap = DayBitmap::from_calendar(&entry, &exceptions).unwrap();

        assert_eq!(bitmap.to_string(), "2024-01-01..2024-01-09 011110001");
    }

    #[test]
    fn test_parse_service_date() {
        assert_eq!(parse_service_date("2024-02-29").unwrap(), date(2024, 2, 29));
        assert_eq!(parse_service_date("20240229").unwrap(), date(2024, 2, 29));
        assert!(parse_service_date("29.2.2024").is_err());
    }
}
