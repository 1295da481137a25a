use std::path::Path;

use anyhow::{Context, Result};

use crate::feed::*;
use crate::pipeline::StopLocation;
use crate::stop_matcher::Candidate;

/// Reads a GTFS folder (or zip) into the canonical feed shape.
pub fn load_gtfs_folder(gtfs_path: &Path) -> Result<Feed> {
    log::info!("Loading GTFS data from {:?}", gtfs_path);
    let gtfs = gtfs_structures::RawGtfs::from_path(gtfs_path)
        .with_context(|| format!("Failed to read GTFS data from {:?}", gtfs_path))?;

    log::info!("Preparing agencies.");
    let mut agencies = vec![];
    for agency in gtfs.agencies? {
        agencies.push(Agency {
            id: agency.id.clone().unwrap_or_else(|| agency.name.clone()),
            stable_id: None,
            name: agency.name.clone(),
            url: Some(agency.url.clone()).filter(|url| !url.is_empty()),
            timezone: Some(agency.timezone.clone()).filter(|tz| !tz.is_empty()),
            phone: agency.phone.clone(),
            email: agency.email.clone(),
        });
    }
    let only_agency = match agencies.as_slice() {
        [agency] => Some(agency.id.clone()),
        _ => None,
    };

    log::info!("Preparing stops...");
    let mut stops = vec![];
    for stop in gtfs.stops? {
        stops.push(Stop {
            id: stop.id.clone(),
            code: stop.code.clone(),
            name: stop.name.clone().unwrap_or_default(),
            parent_station: stop.parent_station.clone().filter(|parent| !parent.is_empty()),
            latitude: stop.latitude,
            longitude: stop.longitude,
            zone_id: stop.zone_id.clone().filter(|zone| !zone.is_empty()),
            region_code: None,
        });
    }

    log::info!("Preparing routes.");
    let mut routes = vec![];
    for route in gtfs.routes? {
        routes.push(Route {
            id: route.id.clone(),
            agency_id: route.agency_id.clone().or_else(|| only_agency.clone()),
            short_name: route.short_name.clone(),
            long_name: route.long_name.clone(),
            route_type: match route.route_type {
                gtfs_structures::RouteType::Tramway => RouteType::Tramway,
                gtfs_structures::RouteType::Subway => RouteType::Subway,
                gtfs_structures::RouteType::Rail => RouteType::Rail,
                gtfs_structures::RouteType::Bus => RouteType::Bus,
                gtfs_structures::RouteType::Ferry => RouteType::Ferry,
                gtfs_structures::RouteType::CableCar => RouteType::CableCar,
                gtfs_structures::RouteType::Gondola => RouteType::Gondola,
                gtfs_structures::RouteType::Funicular => RouteType::Funicular,
                gtfs_structures::RouteType::Coach => RouteType::Coach,
                gtfs_structures::RouteType::Air => RouteType::Air,
                gtfs_structures::RouteType::Taxi => RouteType::Taxi,
                gtfs_structures::RouteType::Other(other) => RouteType::Other(other),
            },
        });
    }

    log::info!("Preparing trips.");
    let mut trips = vec![];
    for trip in gtfs.trips? {
        trips.push(Trip {
            id: trip.id.clone(),
            route_id: trip.route_id.clone(),
            service_id: trip.service_id.clone(),
            short_name: trip.trip_short_name.clone(),
            headsign: trip.trip_headsign.clone(),
        });
    }

    log::info!("Preparing stop times.");
    let mut stop_times = vec![];
    for stop_time in gtfs.stop_times? {
        stop_times.push(StopTime {
            trip_id: stop_time.trip_id.clone(),
            stop_id: stop_time.stop_id.clone(),
            stop_sequence: stop_time.stop_sequence,
            arrival_time: stop_time.arrival_time,
            departure_time: stop_time.departure_time,
        });
    }

    log::info!("Preparing calendars.");
    let mut calendar = vec![];
    if let Some(entries) = gtfs.calendar {
        for entry in entries? {
            calendar.push(CalendarEntry {
                service_id: entry.id.clone(),
                monday: entry.monday,
                tuesday: entry.tuesday,
                wednesday: entry.wednesday,
                thursday: entry.thursday,
                friday: entry.friday,
                saturday: entry.saturday,
                sunday: entry.sunday,
                start_date: entry.start_date.to_string(),
                end_date: entry.end_date.to_string(),
            });
        }
    }

    let mut calendar_exceptions = vec![];
    if let Some(calendar_dates) = gtfs.calendar_dates {
        for calendar_date in calendar_dates? {
            calendar_exceptions.push(CalendarException {
                service_id: calendar_date.service_id.clone(),
                date: calendar_date.date.to_string(),
                exception_type: match calendar_date.exception_type {
                    gtfs_structures::Exception::Added => ExceptionType::Added,
                    gtfs_structures::Exception::Deleted => ExceptionType::Removed,
                },
            });
        }
    }

    let feed = Feed {
        agencies,
        stops,
        routes,
        trips,
        stop_times,
        calendar,
        calendar_exceptions,
    };
    log::info!("Loaded {}", feed.summary());
    Ok(feed)
}

/// Stops with coordinates from a GTFS folder, as candidates for the stop matcher.
pub fn load_reference_stops(gtfs_path: &Path) -> Result<Vec<Candidate<StopLocation>>> {
    log::info!("Loading reference stops from {:?}", gtfs_path);
    let gtfs = gtfs_structures::RawGtfs::from_path(gtfs_path)
        .with_context(|| format!("Failed to read GTFS data from {:?}", gtfs_path))?;
    let mut candidates = vec![];
    for stop in gtfs.stops? {
        if let (Some(name), Some(latitude), Some(longitude)) =
            (stop.name.as_ref(), stop.latitude, stop.longitude)
        {
            candidates.push(Candidate {
                name: name.clone(),
                payload: StopLocation {
                    latitude,
                    longitude,
                    region_code: None,
                },
            });
        }
    }
    Ok(candidates)
}
