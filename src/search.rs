//! Search driver.
//!
//! Streams query records in chunks, derives the per-query threshold from
//! the minimiser count, and dispatches to the IBF or HIBF payload. The
//! payload loads on a background thread while the first chunk is read;
//! workers process sub-chunks and results are written in input order
//! through a mutex-guarded writer.

use crate::build::{hash_partition, part_path};
use crate::error::{RaptorError, Result};
use crate::index::{IndexHeader, IndexPayload, RaptorIndex};
use crate::minimizer::{adjust_seed, extract, extract_into, MinimizerWorkspace};
use crate::threshold::{Threshold, ThresholdParams};
use crate::timers::SearchTimers;
use needletail::{parse_fastx_file, FastxReader};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

pub const OUTPUT_HEADER: &str = "#QUERY_NAME\tUSER_BINS";

/// Records per chunk; bounds memory while keeping workers busy.
const CHUNK_RECORDS: usize = 10 * (1 << 20);

#[derive(Debug, Clone)]
pub struct SearchArguments {
    pub index: PathBuf,
    pub query: PathBuf,
    pub output: PathBuf,
    pub errors: usize,
    /// Fraction of the query's minimiser count; overrides the error model.
    pub threshold: Option<f64>,
    pub tau: f64,
    /// Nominal pattern size; defaults to the first query's length.
    pub pattern_size: Option<usize>,
    pub threads: usize,
}

struct QueryRecord {
    id: String,
    seq: Vec<u8>,
}

pub fn run_search(args: &SearchArguments) -> Result<()> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads)
        .build()
        .map_err(|e| RaptorError::internal(format!("cannot build thread pool: {}", e)))?;
    pool.install(|| {
        if args.index.exists() {
            search_single(args)
        } else {
            // partitioned indices exist only as `<index>_<part>` files
            let part0 = part_path(&args.index, 0, 2);
            if part0.exists() {
                search_partitioned(args)
            } else {
                Err(RaptorError::io(
                    &args.index,
                    "open",
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no such index"),
                ))
            }
        }
    })
}

/// `None` for an empty query file: that is a valid run with no records.
fn open_queries(path: &Path) -> Result<Option<Box<dyn FastxReader>>> {
    let metadata = std::fs::metadata(path).map_err(|e| RaptorError::io(path, "stat", e))?;
    if metadata.len() == 0 {
        return Ok(None);
    }
    parse_fastx_file(path)
        .map(Some)
        .map_err(|e| RaptorError::format(path, format!("cannot parse query file: {}", e)))
}

fn read_chunk(
    reader: &mut Box<dyn FastxReader>,
    path: &Path,
    limit: usize,
) -> Result<Vec<QueryRecord>> {
    let mut records = Vec::new();
    while records.len() < limit {
        match reader.next() {
            Some(Ok(record)) => records.push(QueryRecord {
                id: String::from_utf8_lossy(record.id()).into_owned(),
                seq: record.seq().into_owned(),
            }),
            Some(Err(e)) => {
                return Err(RaptorError::format(path, format!("invalid record: {}", e)))
            }
            None => break,
        }
    }
    Ok(records)
}

/// Threshold oracle for this run; `None` when there are no queries at all.
fn make_thresholder(
    args: &SearchArguments,
    header: &IndexHeader,
    first_chunk: &[QueryRecord],
) -> Result<Option<Threshold>> {
    let first = match first_chunk.first() {
        Some(record) => record,
        None => return Ok(None),
    };
    let window = header.window as usize;
    let pattern_size = args.pattern_size.unwrap_or(first.seq.len()).max(window);
    let params = ThresholdParams {
        pattern_size,
        window,
        shape: header.shape,
        errors: args.errors,
        tau: args.tau,
        percentage: args.threshold,
        cache_dir: args.index.parent().map(Path::to_path_buf),
    };
    Threshold::new(&params).map(Some)
}

fn create_output(path: &Path) -> Result<Mutex<BufWriter<File>>> {
    let file = File::create(path).map_err(|e| RaptorError::io(path, "create", e))?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "{}", OUTPUT_HEADER).map_err(|e| RaptorError::io(path, "write", e))?;
    Ok(Mutex::new(writer))
}

fn search_single(args: &SearchArguments) -> Result<()> {
    let header = RaptorIndex::load_header(&args.index)?;
    let loader = {
        let path = args.index.clone();
        std::thread::spawn(move || RaptorIndex::load(&path))
    };

    let mut reader = open_queries(&args.query)?;
    let mut chunk = match reader.as_mut() {
        Some(reader) => read_chunk(reader, &args.query, CHUNK_RECORDS)?,
        None => Vec::new(),
    };
    let thresholder = make_thresholder(args, &header, &chunk)?;

    let index = loader
        .join()
        .map_err(|_| RaptorError::internal("index loader thread panicked".to_string()))??;
    let writer = create_output(&args.output)?;
    let seed = adjust_seed(header.shape.weight());

    let mut timers = SearchTimers::default();
    while !chunk.is_empty() {
        process_chunk(
            &index.payload,
            thresholder.as_ref(),
            &chunk,
            &header,
            seed,
            args.threads,
            &writer,
            &mut timers,
        )?;
        chunk = match reader.as_mut() {
            Some(reader) => read_chunk(reader, &args.query, CHUNK_RECORDS)?,
            None => Vec::new(),
        };
    }

    writer
        .into_inner()
        .unwrap()
        .flush()
        .map_err(|e| RaptorError::io(&args.output, "write", e))?;
    timers.log();
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn process_chunk(
    payload: &IndexPayload,
    thresholder: Option<&Threshold>,
    records: &[QueryRecord],
    header: &IndexHeader,
    seed: u64,
    threads: usize,
    writer: &Mutex<BufWriter<File>>,
    timers: &mut SearchTimers,
) -> Result<()> {
    // small sub-chunks balance load without over-subscribing
    let per_worker = (records.len() + threads * threads - 1) / (threads * threads).max(1);
    let pieces: Vec<(Vec<String>, SearchTimers)> = records
        .par_chunks(per_worker.max(1))
        .map(|slice| {
            let mut ws = MinimizerWorkspace::new();
            let mut local = SearchTimers::default();
            let mut lines = Vec::with_capacity(slice.len());
            for record in slice {
                let started = Instant::now();
                extract_into(&record.seq, header.shape, header.window as usize, seed, &mut ws);
                local.compute_minimiser += started.elapsed();

                let mut line = String::with_capacity(record.id.len() + 16);
                line.push_str(&record.id);
                if !ws.buffer.is_empty() {
                    let threshold = thresholder.map_or(0, |t| t.get(ws.buffer.len()));
                    let started = Instant::now();
                    let hits = payload.membership(&ws.buffer, threshold);
                    local.query_index += started.elapsed();

                    let started = Instant::now();
                    append_hits(&mut line, &hits);
                    local.generate_results += started.elapsed();
                }
                line.push('\n');
                lines.push(line);
            }
            (lines, local)
        })
        .collect();

    let mut w = writer.lock().unwrap();
    for (lines, local) in pieces {
        timers.merge(&local);
        for line in lines {
            w.write_all(line.as_bytes())
                .map_err(|e| RaptorError::io(PathBuf::new(), "write", e))?;
        }
    }
    Ok(())
}

fn append_hits(line: &mut String, hits: &[usize]) {
    if hits.is_empty() {
        return;
    }
    line.push('\t');
    for (i, hit) in hits.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&hit.to_string());
    }
}

/// Loads each part in turn, evaluates the full query set against it and
/// accumulates per-query counts; thresholds are applied once at the end, so
/// results match the single-part build exactly.
fn search_partitioned(args: &SearchArguments) -> Result<()> {
    let part0 = part_path(&args.index, 0, 2);
    let header = RaptorIndex::load_header(&part0)?;
    let parts = header.parts;
    if parts < 2 {
        return Err(RaptorError::format(
            &part0,
            format!("part file declares {} part(s)", parts),
        ));
    }

    let mut reader = open_queries(&args.query)?;
    let mut records = Vec::new();
    while let Some(open) = reader.as_mut() {
        let chunk = read_chunk(open, &args.query, CHUNK_RECORDS)?;
        if chunk.is_empty() {
            break;
        }
        records.extend(chunk);
    }
    let thresholder = make_thresholder(args, &header, &records)?;
    let seed = adjust_seed(header.shape.weight());

    let minimisers: Vec<Vec<u64>> = records
        .par_iter()
        .map(|record| extract(&record.seq, header.shape, header.window as usize, seed))
        .collect();

    let bin_count = header.bin_paths.len();
    let mut counts: Vec<Vec<u32>> = vec![vec![0u32; bin_count]; records.len()];

    for part in 0..parts {
        let path = part_path(&args.index, part, parts);
        let index = RaptorIndex::load(&path)?;
        let ibf = match &index.payload {
            IndexPayload::Ibf(ibf) => ibf,
            IndexPayload::Hibf(_) => {
                return Err(RaptorError::format(
                    &path,
                    "partitioned HIBF indices are not supported",
                ))
            }
        };
        counts
            .par_iter_mut()
            .zip(minimisers.par_iter())
            .for_each(|(row, mins)| {
                let subset: Vec<u64> = mins
                    .iter()
                    .copied()
                    .filter(|&h| hash_partition(h, parts) == part)
                    .collect();
                if subset.is_empty() {
                    return;
                }
                for (bin, count) in ibf.bulk_count(&subset).into_iter().enumerate() {
                    row[bin] += count as u32;
                }
            });
    }

    let writer = create_output(&args.output)?;
    let mut w = writer.lock().unwrap();
    for ((record, mins), row) in records.iter().zip(&minimisers).zip(&counts) {
        let mut line = String::with_capacity(record.id.len() + 16);
        line.push_str(&record.id);
        if !mins.is_empty() {
            let threshold = thresholder.as_ref().map_or(0, |t| t.get(mins.len()));
            let hits: Vec<usize> = row
                .iter()
                .enumerate()
                .filter(|&(_, &c)| c as usize >= threshold)
                .map(|(bin, _)| bin)
                .collect();
            append_hits(&mut line, &hits);
        }
        line.push('\n');
        w.write_all(line.as_bytes())
            .map_err(|e| RaptorError::io(&args.output, "write", e))?;
    }
    w.flush().map_err(|e| RaptorError::io(&args.output, "write", e))?;
    Ok(())
}
