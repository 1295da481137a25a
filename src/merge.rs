//! Folds decoded feeds into one consolidated feed.
//!
//! Every `insert_feed` call resolves the incoming records kind by kind, in the
//! order agencies, stations, platforms, routes, calendar entries, calendar
//! exceptions, trips, stop times. Each stage rewrites foreign keys through the
//! id maps of the stages before it, so a record is only ever compared against
//! parents that already have their final id.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::feed::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Agency,
    Stop,
    Route,
    Service,
    Trip,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Agency => "agency",
            EntityKind::Stop => "stop",
            EntityKind::Route => "route",
            EntityKind::Service => "service",
            EntityKind::Trip => "trip",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    /// The feed refers to something that was not inserted before it. The
    /// consolidated feed is incomplete afterwards and the merge run should stop.
    #[error("{referenced_by} refers to unknown {kind} {id:?}")]
    UnknownReference {
        kind: EntityKind,
        id: String,
        referenced_by: String,
    },

    #[error("Stop {name:?} ({stop_id}) is assigned to zone {existing:?} and to zone {incoming:?}")]
    ConflictingZone {
        stop_id: String,
        name: String,
        existing: String,
        incoming: String,
    },

    #[error("Service {service_id} is both added and removed on {date}")]
    ConflictingException { service_id: String, date: String },
}

pub type Result<T> = std::result::Result<T, MergeError>;

/// Original id -> consolidated id, per entity kind, for one `insert_feed` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMaps {
    pub agencies: HashMap<String, String>,
    pub stops: HashMap<String, String>,
    pub routes: HashMap<String, String>,
    pub services: HashMap<String, String>,
    pub trips: HashMap<String, String>,
}

/// Ids already taken by one entity kind.
#[derive(Debug, Default)]
struct IdSpace {
    used: HashSet<String>,
    next_suffix: HashMap<String, usize>,
}

impl IdSpace {
    /// Keeps `original` if it is free, otherwise returns `original/n` for the
    /// smallest free `n`. Ids are never released, so the search can resume
    /// from the last suffix handed out for the same original.
    fn allocate(&mut self, original: &str) -> String {
        if self.used.insert(original.to_string()) {
            return original.to_string();
        }
        let suffix = self.next_suffix.entry(original.to_string()).or_insert(0);
        loop {
            let candidate = format!("{original}/{suffix}");
            *suffix += 1;
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.used.contains(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StopKey {
    name: String,
    is_railway: bool,
    parent_station: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CalendarPattern {
    weekdays: [bool; 7],
    start_date: String,
    end_date: String,
}

impl From<&CalendarEntry> for CalendarPattern {
    fn from(entry: &CalendarEntry) -> Self {
        CalendarPattern {
            weekdays: entry.weekdays(),
            start_date: entry.start_date.clone(),
            end_date: entry.end_date.clone(),
        }
    }
}

/// The consolidated feed of one merge run together with its lookup indices.
///
/// All mutation goes through `&mut self`; feeds are inserted one at a time.
#[derive(Debug, Default)]
pub struct MergeEngine {
    feed: Feed,

    agency_ids: IdSpace,
    stop_ids: IdSpace,
    route_ids: IdSpace,
    service_ids: IdSpace,
    trip_ids: IdSpace,

    agency_by_name: HashMap<String, String>,
    agency_by_stable_id: HashMap<String, String>,
    stop_by_key: HashMap<StopKey, String>,
    stop_index: HashMap<String, usize>,
    route_by_name: HashMap<String, String>,
    service_by_pattern: HashMap<CalendarPattern, String>,
    services_with_exceptions: HashSet<String>,
    exceptions: HashMap<(String, String), ExceptionType>,
}

/// Ids of stops served by a rail-like route, plus the stations containing them.
pub fn railway_stop_ids(feed: &Feed) -> HashSet<String> {
    let rail_routes: HashSet<&str> = feed
        .routes
        .iter()
        .filter(|route| route.route_type.is_rail_like())
        .map(|route| route.id.as_str())
        .collect();
    let rail_trips: HashSet<&str> = feed
        .trips
        .iter()
        .filter(|trip| rail_routes.contains(trip.route_id.as_str()))
        .map(|trip| trip.id.as_str())
        .collect();
    let mut railway: HashSet<String> = feed
        .stop_times
        .iter()
        .filter(|stop_time| rail_trips.contains(stop_time.trip_id.as_str()))
        .map(|stop_time| stop_time.stop_id.clone())
        .collect();
    let parent_of: HashMap<&str, &str> = feed
        .stops
        .iter()
        .filter_map(|stop| Some((stop.id.as_str(), stop.parent_station.as_deref()?)))
        .collect();
    let mut ancestors = vec![];
    for id in &railway {
        let mut current = id.as_str();
        // Bounded by the stop count in case of a parent cycle.
        for _ in 0..feed.stops.len() {
            let Some(&parent) = parent_of.get(current) else {
                break;
            };
            ancestors.push(parent.to_string());
            current = parent;
        }
    }
    railway.extend(ancestors);
    railway
}

fn resolve(
    map: &HashMap<String, String>,
    kind: EntityKind,
    id: &str,
    referenced_by: impl FnOnce() -> String,
) -> Result<String> {
    map.get(id)
        .cloned()
        .ok_or_else(|| MergeError::UnknownReference {
            kind,
            id: id.to_string(),
            referenced_by: referenced_by(),
        })
}

fn ensure_known(
    ids: &IdSpace,
    kind: EntityKind,
    id: &str,
    referenced_by: impl FnOnce() -> String,
) -> Result<()> {
    if ids.contains(id) {
        Ok(())
    } else {
        Err(MergeError::UnknownReference {
            kind,
            id: id.to_string(),
            referenced_by: referenced_by(),
        })
    }
}

impl MergeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    pub fn into_feed(self) -> Feed {
        self.feed
    }

    /// Folds one decoded feed into the consolidated feed.
    ///
    /// On error the call is aborted part way: kinds handled before the failing
    /// record are already in the consolidated feed. Callers should treat that
    /// as fatal for the merge run.
    pub fn insert_feed(&mut self, feed: Feed) -> Result<IdMaps> {
        log::info!("Merging feed with {}", feed.summary());
        let railway = railway_stop_ids(&feed);
        let services_with_exceptions: HashSet<String> = feed
            .calendar_exceptions
            .iter()
            .map(|exception| exception.service_id.clone())
            .collect();
        let mut maps = IdMaps::default();

        log::debug!("Merging agencies...");
        for agency in feed.agencies {
            let original = agency.id.clone();
            let id = self.insert_agency(agency);
            maps.agencies.insert(original, id);
        }

        log::debug!("Merging stations...");
        let (stations, mut platforms): (Vec<Stop>, Vec<Stop>) =
            feed.stops.into_iter().partition(Stop::is_station);
        for station in stations {
            let original = station.id.clone();
            let is_railway = railway.contains(&original);
            let id = self.insert_stop(station, is_railway)?;
            maps.stops.insert(original, id);
        }

        log::debug!("Merging platforms...");
        // Platforms may hang below other platforms, so keep going while a pass
        // resolves at least one parent.
        while !platforms.is_empty() {
            let (ready, pending): (Vec<Stop>, Vec<Stop>) =
                platforms.into_iter().partition(|platform| {
                    platform
                        .parent_station
                        .as_ref()
                        .is_some_and(|parent| maps.stops.contains_key(parent))
                });
            if ready.is_empty() {
                let orphan = &pending[0];
                let parent = orphan.parent_station.clone().unwrap_or_default();
                return Err(MergeError::UnknownReference {
                    kind: EntityKind::Stop,
                    id: parent,
                    referenced_by: format!("stop {}", orphan.id),
                });
            }
            for mut platform in ready {
                let original = platform.id.clone();
                if let Some(parent) = platform.parent_station.take() {
                    platform.parent_station = Some(resolve(&maps.stops, EntityKind::Stop, &parent, || {
                        format!("stop {original}")
                    })?);
                }
                let is_railway = railway.contains(&original);
                let id = self.insert_stop(platform, is_railway)?;
                maps.stops.insert(original, id);
            }
            platforms = pending;
        }

        log::debug!("Merging routes...");
        for mut route in feed.routes {
            let original = route.id.clone();
            if let Some(agency_id) = route.agency_id.take() {
                route.agency_id = Some(resolve(&maps.agencies, EntityKind::Agency, &agency_id, || {
                    format!("route {original}")
                })?);
            }
            let id = self.insert_route(route)?;
            maps.routes.insert(original, id);
        }

        log::debug!("Merging calendar...");
        for entry in feed.calendar {
            let original = entry.service_id.clone();
            let mergeable = !services_with_exceptions.contains(&original);
            let id = self.insert_calendar_entry(entry, mergeable);
            maps.services.insert(original, id);
        }
        for mut exception in feed.calendar_exceptions {
            // Services without a calendar entry only exist through their exceptions.
            let service_id = match maps.services.get(&exception.service_id) {
                Some(id) => id.clone(),
                None => {
                    let id = self.service_ids.allocate(&exception.service_id);
                    maps.services.insert(exception.service_id.clone(), id.clone());
                    id
                }
            };
            exception.service_id = service_id;
            self.insert_calendar_exception(exception)?;
        }

        log::debug!("Merging trips...");
        for mut trip in feed.trips {
            let original = trip.id.clone();
            trip.route_id = resolve(&maps.routes, EntityKind::Route, &trip.route_id, || {
                format!("trip {original}")
            })?;
            trip.service_id = resolve(&maps.services, EntityKind::Service, &trip.service_id, || {
                format!("trip {original}")
            })?;
            let id = self.insert_trip(trip)?;
            maps.trips.insert(original, id);
        }

        log::debug!("Copying stop times...");
        for mut stop_time in feed.stop_times {
            let referenced_by =
                || format!("stop time {} of trip {}", stop_time.stop_sequence, stop_time.trip_id);
            let trip_id = resolve(&maps.trips, EntityKind::Trip, &stop_time.trip_id, referenced_by)?;
            let stop_id = resolve(&maps.stops, EntityKind::Stop, &stop_time.stop_id, referenced_by)?;
            stop_time.trip_id = trip_id;
            stop_time.stop_id = stop_id;
            self.insert_stop_time(stop_time)?;
        }

        log::info!("Consolidated feed now has {}", self.feed.summary());
        Ok(maps)
    }

    /// Returns the id of an agency with the same name or stable id, or adds the agency.
    pub fn insert_agency(&mut self, mut agency: Agency) -> String {
        if let Some(existing) = self.agency_by_name.get(&agency.name) {
            log::debug!("Agency {:?} merged into {}", agency.name, existing);
            return existing.clone();
        }
        if let Some(existing) = agency
            .stable_id
            .as_ref()
            .and_then(|stable_id| self.agency_by_stable_id.get(stable_id))
            .cloned()
        {
            log::debug!("Agency {:?} merged into {} by stable id", agency.name, existing);
            // Later feeds may carry the same name without the stable id.
            self.agency_by_name.insert(agency.name, existing.clone());
            return existing;
        }

        let id = self.agency_ids.allocate(&agency.id);
        self.agency_by_name.insert(agency.name.clone(), id.clone());
        if let Some(stable_id) = &agency.stable_id {
            self.agency_by_stable_id.insert(stable_id.clone(), id.clone());
        }
        agency.id = id.clone();
        self.feed.agencies.push(agency);
        id
    }

    /// Returns the id of a stop with the same name, railway classification and
    /// parent, or adds the stop. `parent_station` must already be a
    /// consolidated id.
    pub fn insert_stop(&mut self, mut stop: Stop, is_railway: bool) -> Result<String> {
        if let Some(parent) = &stop.parent_station {
            ensure_known(&self.stop_ids, EntityKind::Stop, parent, || {
                format!("stop {}", stop.id)
            })?;
        }
        let key = StopKey {
            name: stop.name.clone(),
            is_railway,
            parent_station: stop.parent_station.clone(),
        };

        if let Some(existing_id) = self.stop_by_key.get(&key) {
            let existing = &self.feed.stops[self.stop_index[existing_id]];
            if let (Some(existing_zone), Some(incoming_zone)) = (&existing.zone_id, &stop.zone_id) {
                if existing_zone != incoming_zone {
                    return Err(MergeError::ConflictingZone {
                        stop_id: existing_id.clone(),
                        name: stop.name,
                        existing: existing_zone.clone(),
                        incoming: incoming_zone.clone(),
                    });
                }
            }
            log::debug!("Stop {:?} ({}) merged into {}", stop.name, stop.id, existing_id);
            return Ok(existing_id.clone());
        }

        let id = self.stop_ids.allocate(&stop.id);
        stop.id = id.clone();
        self.stop_by_key.insert(key, id.clone());
        self.stop_index.insert(id.clone(), self.feed.stops.len());
        self.feed.stops.push(stop);
        Ok(id)
    }

    /// Routes merge on their display name alone, regardless of agency.
    pub fn insert_route(&mut self, mut route: Route) -> Result<String> {
        if let Some(agency_id) = &route.agency_id {
            ensure_known(&self.agency_ids, EntityKind::Agency, agency_id, || {
                format!("route {}", route.id)
            })?;
        }
        let name = route.display_name().map(str::to_string);
        if let Some(existing) = name.as_ref().and_then(|name| self.route_by_name.get(name)) {
            log::debug!("Route {:?} ({}) merged into {}", name, route.id, existing);
            return Ok(existing.clone());
        }

        let id = self.route_ids.allocate(&route.id);
        if let Some(name) = name {
            self.route_by_name.insert(name, id.clone());
        }
        route.id = id.clone();
        self.feed.routes.push(route);
        Ok(id)
    }

    /// Reuses a service with the same weekly pattern and date range when
    /// `mergeable` is set and the existing service has no exceptions either.
    pub fn insert_calendar_entry(&mut self, mut entry: CalendarEntry, mergeable: bool) -> String {
        let pattern = CalendarPattern::from(&entry);
        if mergeable {
            if let Some(existing) = self
                .service_by_pattern
                .get(&pattern)
                .filter(|existing| !self.services_with_exceptions.contains(*existing))
            {
                log::debug!("Service {} merged into {}", entry.service_id, existing);
                return existing.clone();
            }
        }

        let id = self.service_ids.allocate(&entry.service_id);
        if mergeable {
            self.service_by_pattern.entry(pattern).or_insert_with(|| id.clone());
        }
        entry.service_id = id.clone();
        self.feed.calendar.push(entry);
        id
    }

    /// Adds an exception for an already consolidated service.
    ///
    /// An exact duplicate of an exception already present is dropped; one that
    /// contradicts it is an error.
    pub fn insert_calendar_exception(&mut self, exception: CalendarException) -> Result<()> {
        ensure_known(&self.service_ids, EntityKind::Service, &exception.service_id, || {
            format!("calendar exception on {}", exception.date)
        })?;
        let key = (exception.service_id.clone(), exception.date.clone());
        match self.exceptions.get(&key) {
            Some(existing) if *existing == exception.exception_type => {
                log::debug!(
                    "Dropping duplicate exception for service {} on {}",
                    exception.service_id,
                    exception.date
                );
                Ok(())
            }
            Some(_) => Err(MergeError::ConflictingException {
                service_id: exception.service_id,
                date: exception.date,
            }),
            None => {
                self.exceptions.insert(key, exception.exception_type);
                self.services_with_exceptions.insert(exception.service_id.clone());
                self.feed.calendar_exceptions.push(exception);
                Ok(())
            }
        }
    }

    /// Trips are never merged; each one gets its own id.
    pub fn insert_trip(&mut self, mut trip: Trip) -> Result<String> {
        ensure_known(&self.route_ids, EntityKind::Route, &trip.route_id, || {
            format!("trip {}", trip.id)
        })?;
        ensure_known(&self.service_ids, EntityKind::Service, &trip.service_id, || {
            format!("trip {}", trip.id)
        })?;
        let id = self.trip_ids.allocate(&trip.id);
        trip.id = id.clone();
        self.feed.trips.push(trip);
        Ok(id)
    }

    pub fn insert_stop_time(&mut self, stop_time: StopTime) -> Result<()> {
        let referenced_by = || format!("stop time {} of trip {}", stop_time.stop_sequence, stop_time.trip_id);
        ensure_known(&self.trip_ids, EntityKind::Trip, &stop_time.trip_id, referenced_by)?;
        ensure_known(&self.stop_ids, EntityKind::Stop, &stop_time.stop_id, referenced_by)?;
        self.feed.stop_times.push(stop_time);
        Ok(())
    }
}
