use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use futures::future::{join_all, try_join_all};

use crate::feed::Feed;
use crate::gtfs_import;
use crate::merge::{MergeEngine, MergeError};
use crate::stop_matcher::{Candidate, StopMatcher};

/// What a reference stop contributes to a stop without coordinates.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StopLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub region_code: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct ReferenceStop {
    name: String,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    region_code: Option<String>,
}

/// Reads reference stops from a JSON list of `{name, latitude, longitude, region_code}`
/// objects, or from the stops of a GTFS folder.
pub fn load_reference(path: &Path) -> Result<Vec<Candidate<StopLocation>>> {
    if path.extension().is_some_and(|extension| extension == "json") {
        log::info!("Loading reference stops from {:?}", path);
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open reference stops {:?}", path))?;
        let stops: Vec<ReferenceStop> = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse reference stops {:?}", path))?;
        Ok(stops
            .into_iter()
            .map(|stop| Candidate {
                name: stop.name,
                payload: StopLocation {
                    latitude: stop.latitude,
                    longitude: stop.longitude,
                    region_code: stop.region_code,
                },
            })
            .collect())
    } else {
        gtfs_import::load_reference_stops(path)
    }
}

/// Copies coordinates (and a missing region code) from the best reference
/// match onto every stop without coordinates. Returns how many stops got a
/// location; stops without a good enough match are left untouched.
pub fn fill_missing_locations(
    feed: &mut Feed,
    matcher: &StopMatcher<StopLocation>,
    min_score: f64,
) -> usize {
    let mut filled = 0;
    for stop in feed.stops.iter_mut().filter(|stop| !stop.has_location()) {
        let Some(found) = matcher.best_match(&stop.name, min_score) else {
            log::debug!("No reference location for stop {:?}", stop.name);
            continue;
        };
        log::debug!(
            "Stop {:?} located as {:?} (score {:.2})",
            stop.name,
            found.name,
            found.score
        );
        stop.latitude = Some(found.payload.latitude);
        stop.longitude = Some(found.payload.longitude);
        if stop.region_code.is_none() {
            stop.region_code = found.payload.region_code.clone();
        }
        filled += 1;
    }
    filled
}

pub struct LoadedFeed {
    pub path: PathBuf,
    pub feed: Feed,
}

/// Runs `fill_missing_locations` on every decoded feed, before any of them is merged.
pub fn fill_missing_locations_in_feeds(
    feeds: &mut [LoadedFeed],
    matcher: &StopMatcher<StopLocation>,
    min_score: f64,
) -> usize {
    feeds
        .iter_mut()
        .map(|loaded| {
            let filled = fill_missing_locations(&mut loaded.feed, matcher, min_score);
            log::info!("Filled in coordinates of {} stops in {:?}", filled, loaded.path);
            filled
        })
        .sum()
}

/// Loads every GTFS path on the blocking pool. A path that fails to load is
/// logged and skipped; the others are returned in input order.
pub async fn load_feeds(paths: &[PathBuf]) -> Vec<LoadedFeed> {
    let tasks = paths.iter().cloned().map(|path| {
        tokio::task::spawn_blocking(move || {
            let feed = gtfs_import::load_gtfs_folder(&path);
            (path, feed)
        })
    });

    let mut loaded = vec![];
    for result in join_all(tasks).await {
        match result {
            Ok((path, Ok(feed))) => loaded.push(LoadedFeed { path, feed }),
            Ok((path, Err(error))) => log::warn!("Skipping {:?}: {:#}", path, error),
            Err(error) => log::warn!("Loading task failed: {}", error),
        }
    }
    loaded
}

/// Groups paths by their parent directory, keeping first-appearance order.
pub fn partition_by_parent(paths: &[PathBuf]) -> Vec<Vec<PathBuf>> {
    let mut partitions: Vec<(Option<&Path>, Vec<PathBuf>)> = vec![];
    for path in paths {
        let parent = path.parent();
        match partitions.iter_mut().find(|(key, _)| *key == parent) {
            Some((_, group)) => group.push(path.clone()),
            None => partitions.push((parent, vec![path.clone()])),
        }
    }
    partitions.into_iter().map(|(_, group)| group).collect()
}

pub fn merge_feeds(feeds: impl IntoIterator<Item = Feed>) -> std::result::Result<Feed, MergeError> {
    let mut engine = MergeEngine::new();
    for feed in feeds {
        engine.insert_feed(feed)?;
    }
    Ok(engine.into_feed())
}

/// Merges each partition with its own engine on the blocking pool, then
/// merges the partial results, in partition order, into one feed.
pub async fn merge_partitioned(partitions: Vec<Vec<Feed>>) -> Result<Feed> {
    let tasks = partitions.into_iter().enumerate().map(|(i, feeds)| {
        tokio::task::spawn_blocking(move || {
            log::info!("Merging partition {} ({} feeds)", i, feeds.len());
            merge_feeds(feeds)
        })
    });
    let partial = try_join_all(tasks)
        .await?
        .into_iter()
        .collect::<std::result::Result<Vec<Feed>, MergeError>>()?;

    log::info!("Combining {} partial feeds", partial.len());
    Ok(merge_feeds(partial)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::*;

    fn stop(id: &str, name: &str) -> Stop {
        Stop {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    fn bus_feed(agency: &str, stops: &[(&str, &str)]) -> Feed {
        Feed {
            agencies: vec![Agency {
                id: "A".into(),
                name: agency.into(),
                ..Default::default()
            }],
            stops: stops.iter().map(|(id, name)| stop(id, name)).collect(),
            routes: vec![Route {
                id: "R".into(),
                agency_id: Some("A".into()),
                short_name: Some(format!("{agency} 1")),
                long_name: None,
                route_type: RouteType::Bus,
            }],
            trips: vec![Trip {
                id: "T".into(),
                route_id: "R".into(),
                service_id: "S".into(),
                ..Default::default()
            }],
            stop_times: stops
                .iter()
                .enumerate()
                .map(|(i, (id, _))| StopTime {
                    trip_id: "T".into(),
                    stop_id: id.to_string(),
                    stop_sequence: i as u16,
                    ..Default::default()
                })
                .collect(),
            calendar: vec![CalendarEntry {
                service_id: "S".into(),
                saturday: true,
                sunday: true,
                start_date: "2024-01-01".into(),
                end_date: "2024-06-30".into(),
                ..Default::default()
            }],
            calendar_exceptions: vec![],
        }
    }

    #[test]
    fn test_fill_missing_locations() {
        let matcher = StopMatcher::build(vec![Candidate {
            name: "Náměstí Míru".into(),
            payload: StopLocation {
                latitude: 50.0755,
                longitude: 14.4378,
                region_code: Some("CZ010".into()),
            },
        }]);
        let mut feed = bus_feed("DPP", &[("1", "nám. Míru"), ("2", "Želivského")]);
        feed.stops.push(Stop {
            latitude: Some(1.0),
            longitude: Some(2.0),
            ..stop("3", "Náměstí Míru")
        });

        assert_eq!(fill_missing_locations(&mut feed, &matcher, 0.8), 1);

        assert_eq!(feed.stops[0].latitude, Some(50.0755));
        assert_eq!(feed.stops[0].region_code.as_deref(), Some("CZ010"));
        assert!(!feed.stops[1].has_location());
        assert_eq!(feed.stops[2].latitude, Some(1.0));
        assert_eq!(feed.stops[2].region_code, None);
    }

    #[test]
    fn test_locations_are_filled_before_merging() {
        let matcher = StopMatcher::build(vec![Candidate {
            name: "Turnov".into(),
            payload: StopLocation {
                latitude: 50.58,
                longitude: 15.15,
                region_code: None,
            },
        }]);
        let located = Stop {
            latitude: Some(50.0),
            longitude: Some(15.0),
            ..stop("1", "Semily")
        };
        let mut feeds = vec![
            LoadedFeed {
                path: PathBuf::from("a"),
                feed: bus_feed("ČSAD Liberec", &[("1", "Turnov"), ("2", "Semily")]),
            },
            LoadedFeed {
                path: PathBuf::from("b"),
                feed: Feed {
                    stops: vec![located, stop("2", "Turnov")],
                    ..bus_feed("BusLine", &[("1", "Semily"), ("2", "Turnov")])
                },
            },
        ];

        assert_eq!(fill_missing_locations_in_feeds(&mut feeds, &matcher, 0.8), 2);
        assert_eq!(feeds[0].feed.stops[0].latitude, Some(50.58));
        assert!(!feeds[0].feed.stops[1].has_location());
        assert_eq!(feeds[1].feed.stops[1].latitude, Some(50.58));

        // The first record of a merged stop keeps its coordinates.
        let merged = merge_feeds(feeds.into_iter().map(|loaded| loaded.feed)).unwrap();
        let semily = merged.stops.iter().find(|s| s.name == "Semily").unwrap();
        assert!(!semily.has_location());
        let turnov = merged.stops.iter().find(|s| s.name == "Turnov").unwrap();
        assert_eq!(turnov.longitude, Some(15.15));
    }

    #[test]
    fn test_partition_by_parent() {
        let paths: Vec<PathBuf> = ["bus/a", "rail/x", "bus/b", "rail/y", "tram"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let partitions = partition_by_parent(&paths);
        assert_eq!(partitions.len(), 3);
        assert_eq!(partitions[0], [PathBuf::from("bus/a"), PathBuf::from("bus/b")]);
        assert_eq!(partitions[1], [PathBuf::from("rail/x"), PathBuf::from("rail/y")]);
        assert_eq!(partitions[2], [PathBuf::from("tram")]);
    }

    #[test]
    fn test_load_reference_json() {
        let path = std::env::temp_dir().join(format!("reference-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"[{"name": "Liberec, Fügnerova", "latitude": 50.77, "longitude": 15.06, "region_code": "CZ051"},
                {"name": "Turnov", "latitude": 50.58, "longitude": 15.15}]"#,
        )
        .unwrap();

        let candidates = load_reference(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].payload.region_code.as_deref(), Some("CZ051"));
        assert_eq!(candidates[1].payload.region_code, None);
    }

    #[tokio::test]
    async fn test_merge_partitioned_matches_sequential_merge() {
        let partitions = vec![
            vec![
                bus_feed("ČSAD Liberec", &[("1", "Liberec, Fügnerova"), ("2", "Turnov")]),
                bus_feed("ČSAD Liberec", &[("1", "Turnov"), ("2", "Semily")]),
            ],
            vec![bus_feed("BusLine", &[("7", "Semily"), ("8", "Jilemnice")])],
        ];
        let sequential = merge_feeds(partitions.iter().flatten().cloned()).unwrap();

        let partitioned = merge_partitioned(partitions).await.unwrap();

        assert!(partitioned.dangling_references().is_empty());
        assert_eq!(partitioned.summary(), sequential.summary());
        assert_eq!(partitioned.stops.len(), 4);
        assert_eq!(partitioned.agencies.len(), 2);
    }

    #[tokio::test]
    async fn test_load_feeds_skips_failures() {
        let loaded = load_feeds(&[PathBuf::from("/nonexistent/gtfs")]).await;
        assert!(loaded.is_empty());
    }
}
