//! Canonical feed shape shared by decoders, the merge engine and the export.
//!
//! Dates are kept as ISO `YYYY-MM-DD` strings so that the whole feed can be
//! archived with rkyv; `calendar_bitmap::parse_service_date` turns them back
//! into `NaiveDate`s.

use std::collections::HashSet;
use std::fmt;

#[derive(
    rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, serde::Serialize, serde::Deserialize,
)]
#[derive(Debug, Clone, Default, PartialEq)]
#[rkyv(derive(Debug))]
pub struct Feed {
    pub agencies: Vec<Agency>,
    pub stops: Vec<Stop>,
    pub routes: Vec<Route>,
    pub trips: Vec<Trip>,
    pub stop_times: Vec<StopTime>,
    pub calendar: Vec<CalendarEntry>,
    pub calendar_exceptions: Vec<CalendarException>,
}

#[derive(
    rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, serde::Serialize, serde::Deserialize,
)]
#[derive(Debug, Clone, Default, PartialEq)]
#[rkyv(derive(Debug))]
pub struct Agency {
    pub id: String,
    /// Identifier that denotes the same operator across feeds, if the source has one.
    pub stable_id: Option<String>,
    pub name: String,
    pub url: Option<String>,
    pub timezone: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

#[derive(
    rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, serde::Serialize, serde::Deserialize,
)]
#[derive(Debug, Clone, Default, PartialEq)]
#[rkyv(derive(Debug))]
pub struct Stop {
    pub id: String,
    pub code: Option<String>,
    pub name: String,
    pub parent_station: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub zone_id: Option<String>,
    pub region_code: Option<String>,
}

impl Stop {
    pub fn is_station(&self) -> bool {
        self.parent_station.is_none()
    }

    pub fn has_location(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

#[derive(
    rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, serde::Serialize, serde::Deserialize,
)]
#[derive(Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct Route {
    pub id: String,
    pub agency_id: Option<String>,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub route_type: RouteType,
}

impl Route {
    /// The name a passenger sees: the short name, or the long name if there is none.
    pub fn display_name(&self) -> Option<&str> {
        [self.short_name.as_deref(), self.long_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|name| !name.is_empty())
    }
}

#[derive(
    rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, serde::Serialize, serde::Deserialize,
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[rkyv(derive(Debug))]
pub enum RouteType {
    Tramway,
    Subway,
    Rail,
    Bus,
    Ferry,
    CableCar,
    Gondola,
    Funicular,
    Coach,
    Air,
    Taxi,
    Other(i16),
}

impl RouteType {
    /// Rail-like route types: plain GTFS rail and the extended "Railway Service" codes.
    ///
    /// This is only a heuristic. Stops with the same name at different places are
    /// still told apart only by this flag, so changing the set changes merge output.
    pub fn is_rail_like(self) -> bool {
        match self {
            RouteType::Rail => true,
            RouteType::Other(code) => (100..=117).contains(&code),
            _ => false,
        }
    }
}

#[derive(
    rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, serde::Serialize, serde::Deserialize,
)]
#[derive(Debug, Clone, Default, PartialEq)]
#[rkyv(derive(Debug))]
pub struct Trip {
    pub id: String,
    pub route_id: String,
    pub service_id: String,
    pub short_name: Option<String>,
    pub headsign: Option<String>,
}

#[derive(
    rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, serde::Serialize, serde::Deserialize,
)]
#[derive(Debug, Clone, Default, PartialEq)]
#[rkyv(derive(Debug))]
pub struct StopTime {
    pub trip_id: String,
    pub stop_id: String,
    pub stop_sequence: u16,
    /// Seconds after midnight of the service day.
    pub arrival_time: Option<u32>,
    pub departure_time: Option<u32>,
}

#[derive(
    rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, serde::Serialize, serde::Deserialize,
)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
#[rkyv(derive(Debug))]
pub struct CalendarEntry {
    pub service_id: String,
    pub monday: bool,
    pub tuesday: bool,
    pub wednesday: bool,
    pub thursday: bool,
    pub friday: bool,
    pub saturday: bool,
    pub sunday: bool,
    pub start_date: String,
    pub end_date: String,
}

impl CalendarEntry {
    pub fn weekdays(&self) -> [bool; 7] {
        [
            self.monday,
            self.tuesday,
            self.wednesday,
            self.thursday,
            self.friday,
            self.saturday,
            self.sunday,
        ]
    }
}

#[derive(
    rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, serde::Serialize, serde::Deserialize,
)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[rkyv(derive(Debug))]
pub struct CalendarException {
    pub service_id: String,
    pub date: String,
    pub exception_type: ExceptionType,
}

#[derive(
    rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, serde::Serialize, serde::Deserialize,
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[rkyv(derive(Debug))]
pub enum ExceptionType {
    Added,
    Removed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedSummary {
    pub agencies: usize,
    pub stops: usize,
    pub routes: usize,
    pub trips: usize,
    pub stop_times: usize,
    pub calendar: usize,
    pub calendar_exceptions: usize,
}

impl fmt::Display for FeedSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} agencies, {} stops, {} routes, {} trips, {} stop times, {} calendar entries, {} calendar exceptions",
            self.agencies,
            self.stops,
            self.routes,
            self.trips,
            self.stop_times,
            self.calendar,
            self.calendar_exceptions
        )
    }
}

impl Feed {
    pub fn summary(&self) -> FeedSummary {
        FeedSummary {
            agencies: self.agencies.len(),
            stops: self.stops.len(),
            routes: self.routes.len(),
            trips: self.trips.len(),
            stop_times: self.stop_times.len(),
            calendar: self.calendar.len(),
            calendar_exceptions: self.calendar_exceptions.len(),
        }
    }

    /// Describes every foreign key that does not resolve inside this feed.
    pub fn dangling_references(&self) -> Vec<String> {
        let agencies: HashSet<&str> = self.agencies.iter().map(|a| a.id.as_str()).collect();
        let stops: HashSet<&str> = self.stops.iter().map(|s| s.id.as_str()).collect();
        let routes: HashSet<&str> = self.routes.iter().map(|r| r.id.as_str()).collect();
        let trips: HashSet<&str> = self.trips.iter().map(|t| t.id.as_str()).collect();
        let services: HashSet<&str> = self
            .calendar
            .iter()
            .map(|c| c.service_id.as_str())
            .chain(self.calendar_exceptions.iter().map(|e| e.service_id.as_str()))
            .collect();

        let mut dangling = vec![];
        for stop in &self.stops {
            if let Some(parent) = &stop.parent_station {
                if !stops.contains(parent.as_str()) {
                    dangling.push(format!("stop {} -> parent station {}", stop.id, parent));
                }
            }
        }
        for route in &self.routes {
            if let Some(agency) = &route.agency_id {
                if !agencies.contains(agency.as_str()) {
                    dangling.push(format!("route {} -> agency {}", route.id, agency));
                }
            }
        }
        for trip in &self.trips {
            if !routes.contains(trip.route_id.as_str()) {
                dangling.push(format!("trip {} -> route {}", trip.id, trip.route_id));
            }
            if !services.contains(trip.service_id.as_str()) {
                dangling.push(format!("trip {} -> service {}", trip.id, trip.service_id));
            }
        }
        for stop_time in &self.stop_times {
            if !trips.contains(stop_time.trip_id.as_str()) {
                dangling.push(format!("stop time -> trip {}", stop_time.trip_id));
            }
            if !stops.contains(stop_time.stop_id.as_str()) {
                dangling.push(format!(
                    "stop time of trip {} -> stop {}",
                    stop_time.trip_id, stop_time.stop_id
                ));
            }
        }
        dangling
    }
}

impl ArchivedFeed {
    pub fn summary(&self) -> FeedSummary {
        FeedSummary {
            agencies: self.agencies.len(),
            stops: self.stops.len(),
            routes: self.routes.len(),
            trips: self.trips.len(),
            stop_times: self.stop_times.len(),
            calendar: self.calendar.len(),
            calendar_exceptions: self.calendar_exceptions.len(),
        }
    }
}
