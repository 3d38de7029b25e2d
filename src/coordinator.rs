//! Run the time aggregation for every station, in parallel, into one artifact.
//!
//! Before anything is aggregated, the artifacts already in the output directory are inspected
//! to decide whether to create a new artifact, extend an existing one or do nothing at all (see
//! [`decide`]).
//!
//! Either way, tables are written to a `.partial` copy of the artifact. Stations are handed out
//! to a pool of workers over a channel; each worker reads raw data and aggregates on its own and
//! only takes the writer's lock to append a finished table. Once all workers are done the
//! `.partial` file is renamed to its final name, and an artifact that was extended is removed.
//! Stations that failed are left out entirely, even if the extended artifact had them.
//!
//! A `.partial` file already present (from a crashed or aborted run) is never overwritten; the
//! run refuses to start until it has been dealt with.
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDateTime;
use crossbeam::channel;
use log::{debug, error, info, warn};

use crate::{
    aggregate::aggregate,
    raw::{chunks_for_range, EventSource, SourceChunk},
    store::{
        artifact_stations, list_artifacts, promote, remove_stations, ArtifactName, ArtifactWriter,
    },
    window::{TailPolicy, WindowGrid},
    FlowError, Resolution, StationId,
};

/// What to do given the artifacts that already exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverageDecision {
    /// Aggregate `[begin, end)` into a new artifact.
    Create {
        begin: NaiveDateTime,
        end: NaiveDateTime,
    },
    /// Aggregate `[delta_begin, delta_end)` and add it to a copy of `prior`.
    Extend {
        prior: ArtifactName,
        prior_path: PathBuf,
        delta_begin: NaiveDateTime,
        delta_end: NaiveDateTime,
    },
    /// Nothing to do; the artifact already covers the requested range.
    AlreadyCovered {
        artifact: ArtifactName,
        path: PathBuf,
    },
}

/// Decide how to aggregate `[begin, end)` given the `existing` artifacts.
///
/// Only artifacts with the same resolution are considered. An artifact can be extended if it
/// begins at or before `begin`, ends at or after `begin` but before `end`, and its span is a
/// whole number of windows. If several can be extended, the one ending last is used.
pub fn decide(
    existing: &[(ArtifactName, PathBuf)],
    begin: NaiveDateTime,
    end: NaiveDateTime,
    resolution: Resolution,
) -> Result<CoverageDecision, FlowError> {
    if begin >= end {
        return Err(FlowError::InvalidRange { begin, end });
    }
    let candidates = existing
        .iter()
        .filter(|(name, _)| name.resolution == resolution);

    if let Some((name, path)) = candidates
        .clone()
        .find(|(name, _)| name.begin <= begin && end <= name.end)
    {
        return Ok(CoverageDecision::AlreadyCovered {
            artifact: *name,
            path: path.clone(),
        });
    }

    let step = resolution.delta().num_milliseconds();
    let extendable = candidates
        .filter(|(name, _)| name.begin <= begin && begin <= name.end && name.end < end)
        .filter(|(name, _)| (name.end - name.begin).num_milliseconds() % step == 0)
        .max_by_key(|(name, _)| name.end);

    Ok(match extendable {
        Some((name, path)) => CoverageDecision::Extend {
            prior: *name,
            prior_path: path.clone(),
            delta_begin: name.end,
            delta_end: end,
        },
        None => CoverageDecision::Create { begin, end },
    })
}

/// What to do when a station fails to aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop handing out stations and leave the `.partial` artifact unpromoted.
    Abort,
    /// Log the failure and carry on; the station is left out of the artifact.
    #[default]
    SkipAndWarn,
}

impl FromStr for FailurePolicy {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort" => Ok(FailurePolicy::Abort),
            "skip" => Ok(FailurePolicy::SkipAndWarn),
            _ => Err(FlowError::InvalidConfig {
                name: "ON_STATION_FAILURE".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub artifact: ArtifactName,
    pub path: PathBuf,
    /// The artifact this run extended, if any (it no longer exists).
    pub extended: Option<ArtifactName>,
    /// Number of stations aggregated and written.
    pub aggregated: usize,
    /// Stations that failed (only possible when skipping failures), with the reason.
    pub failed: Vec<(StationId, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunReport),
    AlreadyCovered(ArtifactName, PathBuf),
}

/// One station to aggregate, over a grid, from some chunks.
#[derive(Debug, Clone, Copy)]
struct Job<'a> {
    station: StationId,
    grid: &'a WindowGrid,
    chunks: &'a [SourceChunk],
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    pub workers: usize,
    pub tail: TailPolicy,
    pub failure_policy: FailurePolicy,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            tail: TailPolicy::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl Coordinator {
    /// Aggregate `stations` over `[begin, end)` into an artifact in `output_dir`.
    ///
    /// `chunks` are all available raw sources; only those overlapping what needs to be
    /// aggregated are read.
    #[allow(clippy::too_many_arguments)]
    pub fn run<S: EventSource + ?Sized>(
        &self,
        source: &S,
        chunks: &[SourceChunk],
        stations: &[StationId],
        output_dir: &Path,
        begin: NaiveDateTime,
        end: NaiveDateTime,
        resolution: Resolution,
    ) -> Result<RunOutcome, FlowError> {
        let existing = list_artifacts(output_dir)?;
        let decision = decide(&existing, begin, end, resolution)?;

        let (artifact, prior) = match &decision {
            CoverageDecision::AlreadyCovered { artifact, path } => {
                info!("[{begin}, {end}) already covered by {path:?}.");
                return Ok(RunOutcome::AlreadyCovered(*artifact, path.clone()));
            }
            CoverageDecision::Create { begin, end } => {
                info!("Creating a new artifact for [{begin}, {end}).");
                (
                    ArtifactName {
                        resolution,
                        begin: *begin,
                        end: *end,
                    },
                    None,
                )
            }
            CoverageDecision::Extend {
                prior,
                prior_path,
                delta_begin,
                delta_end,
            } => {
                info!("Extending {prior_path:?} with [{delta_begin}, {delta_end}).");
                (
                    ArtifactName {
                        resolution,
                        begin: prior.begin,
                        end: *delta_end,
                    },
                    Some((*prior, prior_path.as_path())),
                )
            }
        };

        let partial = output_dir.join(artifact.partial_file_name());
        if partial.exists() {
            error!("{partial:?} was left by an earlier run; not overwriting it.");
            return Err(FlowError::StalePartial(partial));
        }
        let full_grid = WindowGrid::new(artifact.begin, artifact.end, resolution, self.tail)?;
        let full_chunks = chunks_for_range(chunks, artifact.begin, artifact.end);

        let (writer, delta) = match prior {
            None => (ArtifactWriter::create(&partial)?, None),
            Some((prior, prior_path)) => {
                fs::copy(prior_path, &partial)?;
                let grid = WindowGrid::new(prior.end, artifact.end, resolution, self.tail)?;
                let delta_chunks = chunks_for_range(chunks, prior.end, artifact.end);
                let present = artifact_stations(prior_path)?;
                (
                    ArtifactWriter::append_to(&partial)?,
                    Some((grid, delta_chunks, present)),
                )
            }
        };

        // Stations already in the artifact being extended only need the delta; the others (and
        // everything when creating) need the full range.
        let mut jobs = vec![];
        let mut all_stations: BTreeSet<StationId> = stations.iter().copied().collect();
        if let Some((_, _, present)) = &delta {
            all_stations.extend(present);
        }
        for station in all_stations {
            let job = match &delta {
                Some((grid, delta_chunks, present)) if present.contains(&station) => Job {
                    station,
                    grid,
                    chunks: delta_chunks,
                },
                _ => Job {
                    station,
                    grid: &full_grid,
                    chunks: &full_chunks,
                },
            };
            jobs.push(job);
        }

        let (aggregated, failed) = self.dispatch(source, &writer, jobs)?;
        writer.finish()?;

        if !failed.is_empty() && self.failure_policy == FailurePolicy::Abort {
            error!(
                "Aborted after {} station(s) failed; partial output left at {partial:?}.",
                failed.len()
            );
            return Err(FlowError::StationsFailed(failed));
        }

        // A failed station may still have rows from the artifact being extended (or a partly
        // written table); it must be absent so that the next run aggregates its whole range.
        if !failed.is_empty() {
            let stations: HashSet<StationId> =
                failed.iter().map(|(station, _)| *station).collect();
            remove_stations(&partial, &stations)?;
        }

        let final_path = output_dir.join(artifact.file_name());
        promote(&partial, &final_path)?;
        if let Some((_, prior_path)) = prior {
            fs::remove_file(prior_path)?;
            debug!("Removed superseded artifact {prior_path:?}.");
        }
        info!(
            "Wrote {aggregated} station table(s) to {final_path:?} ({} failed).",
            failed.len()
        );

        Ok(RunOutcome::Completed(RunReport {
            artifact,
            path: final_path,
            extended: prior.map(|(name, _)| name),
            aggregated,
            failed,
        }))
    }

    /// Aggregate the jobs on a pool of workers, all appending to `writer`.
    ///
    /// Returns the number of stations written and the stations that failed.
    fn dispatch<S: EventSource + ?Sized>(
        &self,
        source: &S,
        writer: &ArtifactWriter,
        jobs: Vec<Job<'_>>,
    ) -> Result<(usize, Vec<(StationId, String)>), FlowError> {
        let (job_sender, job_receiver) = channel::unbounded();
        for job in jobs {
            // The receiver is still held here, so this can't fail.
            let _ = job_sender.send(job);
        }
        drop(job_sender);

        let (result_sender, result_receiver) = channel::unbounded();
        let stop = AtomicBool::new(false);
        let abort = self.failure_policy == FailurePolicy::Abort;

        crossbeam::thread::scope(|s| {
            for worker in 0..self.workers.max(1) {
                let jobs = job_receiver.clone();
                let results = result_sender.clone();
                let stop = &stop;
                s.spawn(move |_| {
                    for job in jobs.iter() {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        debug!("Worker {worker} aggregating station {}.", job.station);
                        let outcome = aggregate(source, job.station, job.grid, job.chunks)
                            .and_then(|table| writer.append(&table));
                        if outcome.is_err() && abort {
                            stop.store(true, Ordering::Relaxed);
                        }
                        if results.send((job.station, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
        })
        .map_err(|_| FlowError::WorkerPanicked)?;
        drop(result_sender);

        let mut aggregated = 0;
        let mut failed = vec![];
        for (station, outcome) in result_receiver.iter() {
            match outcome {
                Ok(()) => aggregated += 1,
                Err(e) => {
                    warn!("Unable to aggregate station {station}: {e}");
                    failed.push((station, e.to_string()));
                }
            }
        }
        failed.sort();
        Ok((aggregated, failed))
    }
}
