//! Explicit timing metrics.
//!
//! Workers accumulate into local instances; drivers merge them behind a
//! mutex at the end of a run and report through the logger. No process-wide
//! state.

use std::time::Duration;

#[derive(Debug, Default, Clone)]
pub struct BuildTimers {
    pub user_bin_io: Duration,
    pub fill_ibf: Duration,
}

impl BuildTimers {
    pub fn merge(&mut self, other: &BuildTimers) {
        self.user_bin_io += other.user_bin_io;
        self.fill_ibf += other.fill_ibf;
    }

    pub fn log(&self) {
        log::info!(
            "build timings: user bin I/O {:.2?}, filling {:.2?} (summed over workers)",
            self.user_bin_io,
            self.fill_ibf
        );
    }
}

#[derive(Debug, Default, Clone)]
pub struct SearchTimers {
    pub compute_minimiser: Duration,
    pub query_index: Duration,
    pub generate_results: Duration,
}

impl SearchTimers {
    pub fn merge(&mut self, other: &SearchTimers) {
        self.compute_minimiser += other.compute_minimiser;
        self.query_index += other.query_index;
        self.generate_results += other.generate_results;
    }

    pub fn log(&self) {
        log::info!(
            "search timings: minimisers {:.2?}, index lookups {:.2?}, result output {:.2?} (summed over workers)",
            self.compute_minimiser,
            self.query_index,
            self.generate_results
        );
    }
}
