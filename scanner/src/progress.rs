//! Per-level progress bars, fed through a queue so a stalled terminal
//! can never hold the scan back.

use std::collections::BTreeMap;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use observability_deps::tracing::debug;
use tokio::sync::mpsc;

enum Tick {
    Reset(usize),
    Update(usize, u64),
    Finish,
}

/// See the module docs. Dropping the handle finishes the bars.
#[derive(Debug)]
pub(crate) struct ScanProgress {
    tx: mpsc::UnboundedSender<Tick>,
}

impl std::fmt::Debug for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reset(l) => write!(f, "Reset({l})"),
            Self::Update(l, n) => write!(f, "Update({l}, {n})"),
            Self::Finish => write!(f, "Finish"),
        }
    }
}

impl ScanProgress {
    /// Bars for every level; unknown totals show a spinner-style count.
    pub(crate) fn new(totals: &BTreeMap<usize, Option<u64>>) -> Self {
        let multi = MultiProgress::new();
        let mut bars: BTreeMap<usize, ProgressBar> = BTreeMap::new();
        for (level, total) in totals {
            let bar = match total {
                Some(n) => {
                    let bar = multi.add(ProgressBar::new(*n));
                    bar.set_style(
                        ProgressStyle::with_template(
                            "level {prefix}: {bar:30} {pos}/{len} [{elapsed_precise}]",
                        )
                        .expect("static template parses"),
                    );
                    bar
                }
                None => {
                    let bar = multi.add(ProgressBar::new_spinner());
                    bar.set_style(
                        ProgressStyle::with_template("level {prefix}: {pos} [{elapsed_precise}]")
                            .expect("static template parses"),
                    );
                    bar
                }
            };
            bar.set_prefix(level.to_string());
            bars.insert(*level, bar);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(tick) = rx.recv().await {
                match tick {
                    Tick::Reset(level) => {
                        if let Some(bar) = bars.get(&level) {
                            bar.reset();
                        }
                    }
                    Tick::Update(level, n) => {
                        if let Some(bar) = bars.get(&level) {
                            bar.inc(n);
                        }
                    }
                    Tick::Finish => break,
                }
            }
            for bar in bars.values() {
                bar.finish_and_clear();
            }
            debug!("progress drain finished");
        });

        Self { tx }
    }

    pub(crate) fn reset(&self, level: usize) {
        self.tx.send(Tick::Reset(level)).ok();
    }

    pub(crate) fn update(&self, level: usize, n: u64) {
        self.tx.send(Tick::Update(level, n)).ok();
    }

    pub(crate) fn finish(&self) {
        self.tx.send(Tick::Finish).ok();
    }
}
