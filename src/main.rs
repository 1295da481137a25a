use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use indicatif::ProgressIterator;

use schedule_merge::export::{self, MappedFeed};
use schedule_merge::feed::Feed;
use schedule_merge::merge::MergeEngine;
use schedule_merge::pipeline::{self, LoadedFeed};
use schedule_merge::stop_matcher::StopMatcher;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Log individual merge decisions
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Merge GTFS feeds into one consolidated feed
    Merge {
        #[arg(required = true)]
        feeds: Vec<PathBuf>,
        #[arg(long)]
        output: PathBuf,
        /// Also write the consolidated feed as JSON
        #[arg(long)]
        json: Option<PathBuf>,
        /// GTFS folder or JSON file with stop coordinates for stops that have none
        #[arg(long)]
        reference: Option<PathBuf>,
        #[arg(long, default_value_t = 0.8)]
        min_score: f64,
        /// Near misses to log for each stop that stays without coordinates
        #[arg(long, default_value_t = 3)]
        top_n: usize,
        /// Merge feeds from the same directory on their own before combining
        #[arg(long)]
        partition_by_parent: bool,
    },
    /// Print the summary of an exported feed
    Inspect { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    simple_logger::SimpleLogger::new()
        .with_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init()?;

    match args.command {
        Commands::Merge {
            feeds,
            output,
            json,
            reference,
            min_score,
            top_n,
            partition_by_parent,
        } => {
            merge(MergeOptions {
                feeds,
                output,
                json,
                reference,
                min_score,
                top_n,
                partition_by_parent,
            })
            .await
        }
        Commands::Inspect { file } => {
            let mapped = MappedFeed::open(&file)?;
            println!("{}", mapped.archived().summary());
            Ok(())
        }
    }
}

struct MergeOptions {
    feeds: Vec<PathBuf>,
    output: PathBuf,
    json: Option<PathBuf>,
    reference: Option<PathBuf>,
    min_score: f64,
    top_n: usize,
    partition_by_parent: bool,
}

async fn merge(options: MergeOptions) -> Result<()> {
    let mut loaded = pipeline::load_feeds(&options.feeds).await;
    log::info!("Loaded {} of {} feeds", loaded.len(), options.feeds.len());

    let matcher = match &options.reference {
        Some(reference) => {
            let matcher = StopMatcher::build(pipeline::load_reference(reference)?);
            log::info!("Matching stops against {} reference stops", matcher.len());
            let filled =
                pipeline::fill_missing_locations_in_feeds(&mut loaded, &matcher, options.min_score);
            log::info!("Filled in coordinates of {} stops", filled);
            Some(matcher)
        }
        None => None,
    };

    let consolidated = if options.partition_by_parent {
        let mut remaining = loaded;
        let mut feed_partitions: Vec<Vec<Feed>> = vec![];
        for paths in pipeline::partition_by_parent(&options.feeds) {
            let (in_partition, rest): (Vec<LoadedFeed>, Vec<LoadedFeed>) = remaining
                .into_iter()
                .partition(|entry| paths.contains(&entry.path));
            remaining = rest;
            feed_partitions.push(in_partition.into_iter().map(|entry| entry.feed).collect());
        }
        pipeline::merge_partitioned(feed_partitions).await?
    } else {
        let style = indicatif::ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {human_pos:>7}/{human_len:7} {msg}",
        )?;
        let mut engine = MergeEngine::new();
        for loaded in loaded
            .into_iter()
            .progress_with_style(style)
            .with_message("Merge feeds.")
            .with_finish(indicatif::ProgressFinish::AndLeave)
        {
            log::info!("Merging {:?}", loaded.path);
            engine.insert_feed(loaded.feed)?;
        }
        engine.into_feed()
    };

    if let Some(matcher) = &matcher {
        for stop in consolidated.stops.iter().filter(|stop| !stop.has_location()) {
            for found in matcher.query(&stop.name, options.top_n) {
                log::debug!("{:?} near miss: {:?} ({:.2})", stop.name, found.name, found.score);
            }
        }
    }

    let dangling = consolidated.dangling_references();
    for reference in &dangling {
        log::warn!("Dangling reference: {}", reference);
    }

    export::write_feed(&consolidated, &options.output)?;
    if let Some(json) = &options.json {
        export::write_feed_json(&consolidated, json)?;
    }
    log::info!("Done: {}", consolidated.summary());
    Ok(())
}
