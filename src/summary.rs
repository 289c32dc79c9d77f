//! Aggregation of leak reports for `lr_print`.
//!
//! A report file may hold several runs, since the tracker appends to it.  Leaks with identical
//! (symbolized) stacks are merged and ranked by the number of bytes they hold.

use std::{
    collections::{hash_map::Entry, HashMap},
    fmt,
    fmt::{Display, Formatter},
};

use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};

/// Leaks sharing one stack.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct StackLeaks {
    pub leaks: usize,
    pub bytes: usize,
    pub frames: Vec<String>,
}

impl StackLeaks {
    fn format_totals<W: fmt::Write>(&self, f: &mut W) -> Result<(), fmt::Error> {
        write!(
            f,
            "{} {}, {}B",
            self.leaks.to_formatted_string(&Locale::en),
            if self.leaks == 1 { "leak" } else { "leaks" },
            self.bytes.to_formatted_string(&Locale::en)
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Summary {
    pub runs: usize,
    pub stacks: Vec<StackLeaks>,
    #[serde(skip)]
    index: HashMap<Vec<String>, usize>,
}

impl Display for Summary {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        self.fmt_with_threshold(0.0, f)
    }
}

impl Summary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the text of a report file.  Lines that belong to no leak, such as error messages
    /// left by a failed report, are skipped.
    pub fn parse(text: &str) -> Self {
        let mut summary = Summary::new();
        let mut current: Option<(usize, Vec<String>)> = None;

        for line in text.lines() {
            if let Some(size) = line.strip_suffix(" bytes:").and_then(|s| s.parse::<usize>().ok()) {
                if let Some((size, frames)) = current.take() {
                    summary.record(frames, 1, size);
                }
                current = Some((size, Vec::new()));
            } else if line.strip_suffix(" records").map_or(false, |s| s.parse::<usize>().is_ok()) {
                if let Some((size, frames)) = current.take() {
                    summary.record(frames, 1, size);
                }
                summary.runs += 1;
            } else if line.is_empty() {
                if let Some((size, frames)) = current.take() {
                    summary.record(frames, 1, size);
                }
            } else if let Some((_, frames)) = current.as_mut() {
                frames.push(line.to_string());
            }
        }
        if let Some((size, frames)) = current.take() {
            summary.record(frames, 1, size);
        }
        summary
    }

    fn record(&mut self, frames: Vec<String>, leaks: usize, bytes: usize) {
        // The index is not serialized; rebuild it after deserialization.
        if self.index.len() != self.stacks.len() {
            self.index = self
                .stacks
                .iter()
                .enumerate()
                .map(|(i, stack)| (stack.frames.clone(), i))
                .collect();
        }
        match self.index.entry(frames) {
            Entry::Occupied(oe) => {
                let stack = &mut self.stacks[*oe.get()];
                stack.leaks += leaks;
                stack.bytes += bytes;
            }
            Entry::Vacant(ve) => {
                self.stacks.push(StackLeaks {
                    leaks,
                    bytes,
                    frames: ve.key().clone(),
                });
                ve.insert(self.stacks.len() - 1);
            }
        }
    }

    // Merge two summaries.
    pub fn merge(&mut self, other: &Summary) {
        self.runs += other.runs;
        for stack in other.stacks.iter() {
            self.record(stack.frames.clone(), stack.leaks, stack.bytes);
        }
    }

    pub fn total_leaks(&self) -> usize {
        self.stacks.iter().map(|s| s.leaks).sum()
    }

    pub fn total_bytes(&self) -> usize {
        self.stacks.iter().map(|s| s.bytes).sum()
    }

    /// Stacks, heaviest first.
    pub fn ranked(&self) -> Vec<&StackLeaks> {
        let mut ranked: Vec<_> = self.stacks.iter().collect();
        ranked.sort_by(|s1, s2| {
            s2.bytes
                .cmp(&s1.bytes)
                .then(s2.leaks.cmp(&s1.leaks))
                .then(s1.frames.cmp(&s2.frames))
        });
        ranked
    }

    /// Format the summary, folding stacks holding less than `threshold`% of the leaked bytes
    /// into a single line.
    pub fn fmt_with_threshold<W: fmt::Write>(
        &self,
        threshold: f64,
        f: &mut W,
    ) -> Result<(), fmt::Error> {
        let total_bytes = self.total_bytes();
        write!(
            f,
            "{} runs, {} leaks, {}B total",
            self.runs.to_formatted_string(&Locale::en),
            self.total_leaks().to_formatted_string(&Locale::en),
            total_bytes.to_formatted_string(&Locale::en)
        )?;

        let mut below_threshold = 0;
        for stack in self.ranked() {
            if total_bytes > 0 && 100.0 * (stack.bytes as f64) / (total_bytes as f64) < threshold {
                below_threshold += stack.leaks;
                continue;
            }
            f.write_str("\n\n")?;
            stack.format_totals(f)?;
            f.write_str(":")?;
            for frame in stack.frames.iter() {
                f.write_str("\n  ")?;
                f.write_str(frame)?;
            }
        }

        if below_threshold > 0 {
            write!(
                f,
                "\n\n{} leaks in stacks below lr_print threshold ({}%)",
                below_threshold, threshold
            )?;
        }
        Ok(())
    }
}
