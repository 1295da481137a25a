//! Railway timetable messages waiting to be merged, and their cancellations.

use std::collections::BTreeMap;
use std::fmt;

use crate::calendar_bitmap::{BitmapError, DayBitmap};
use crate::feed::{CalendarException, ExceptionType, Feed};
use crate::merge::{MergeEngine, MergeError};

/// Identifies one planned transport: a train and the variant of its timetable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlannedTransportId {
    pub train: String,
    pub variant: String,
}

impl PlannedTransportId {
    pub fn new(train: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            train: train.into(),
            variant: variant.into(),
        }
    }
}

impl fmt::Display for PlannedTransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.train, self.variant)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimetableMessage {
    pub id: PlannedTransportId,
    /// Days on which the train runs.
    pub calendar: DayBitmap,
    /// Agency, stops, route, trips and stop times of the train. Calendar data
    /// in here is ignored; the bitmap is authoritative.
    pub feed: Feed,
}

impl TimetableMessage {
    /// Turns the message into a feed whose trips run on a service named after
    /// the message, defined by one added exception per active day.
    pub fn into_feed(self) -> Feed {
        let service_id = self.id.to_string();
        let mut feed = self.feed;
        for trip in &mut feed.trips {
            trip.service_id = service_id.clone();
        }
        feed.calendar.clear();
        feed.calendar_exceptions = self
            .calendar
            .active_days()
            .map(|day| CalendarException {
                service_id: service_id.clone(),
                date: day.to_string(),
                exception_type: ExceptionType::Added,
            })
            .collect();
        feed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    Stored,
    /// The message replaced an older revision, which is returned.
    Replaced(Box<TimetableMessage>),
    /// The message has no service day. It was not stored, and any older
    /// revision under the same id was dropped as well.
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// No message with that id is stored.
    Unknown,
    /// Some service days are left.
    Reduced,
    /// No service day was left and the message was dropped.
    Removed,
}

#[derive(Debug, Default)]
pub struct MessageStore {
    messages: BTreeMap<PlannedTransportId, TimetableMessage>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a message. A newer revision replaces the stored one.
    pub fn add(&mut self, message: TimetableMessage) -> AddOutcome {
        if !message.calendar.has_any_set() {
            log::warn!("Dropping message {} without any service day", message.id);
            self.messages.remove(&message.id);
            return AddOutcome::Dropped;
        }
        match self.messages.insert(message.id.clone(), message) {
            Some(old) => {
                log::debug!("Message {} replaced by a newer revision", old.id);
                AddOutcome::Replaced(Box::new(old))
            }
            None => AddOutcome::Stored,
        }
    }

    pub fn get(&self, id: &PlannedTransportId) -> Option<&TimetableMessage> {
        self.messages.get(id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimetableMessage> {
        self.messages.values()
    }

    /// Removes the days set in `cancellation` from the message's calendar.
    pub fn cancel(
        &mut self,
        id: &PlannedTransportId,
        cancellation: &DayBitmap,
    ) -> Result<CancelOutcome, BitmapError> {
        let Some(message) = self.messages.get_mut(id) else {
            log::warn!("Cancellation for unknown message {}", id);
            return Ok(CancelOutcome::Unknown);
        };
        match message.calendar.cancel(cancellation)? {
            Some(remaining) => {
                message.calendar = remaining;
                Ok(CancelOutcome::Reduced)
            }
            None => {
                log::debug!("Message {} cancelled on all of its days", id);
                self.messages.remove(id);
                Ok(CancelOutcome::Removed)
            }
        }
    }

    /// Merges every surviving message, in id order, and empties the store.
    pub fn fold_into(self, engine: &mut MergeEngine) -> Result<usize, MergeError> {
        let count = self.messages.len();
        log::info!("Folding {} timetable messages into the consolidated feed", count);
        for message in self.messages.into_values() {
            engine.insert_feed(message.into_feed())?;
        }
        Ok(count)
    }
}
