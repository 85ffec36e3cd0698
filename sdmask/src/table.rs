//! Per-sample mask store the orchestrator writes its result into.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Mask written for samples without any line.
pub const NO_LINE: [i32; 2] = [-1, -1];

/// One sample's MASKLIST plus its no-change bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleMask {
    pub masklist: Vec<[i32; 2]>,
    /// Iteration after which the mask stopped changing.
    pub mask_unchanged_since: Option<u32>,
}

impl SampleMask {
    pub fn new(masklist: Vec<[i32; 2]>) -> Self {
        Self {
            masklist,
            mask_unchanged_since: None,
        }
    }

    /// External NOCHANGE value, `-1` while the mask is still moving.
    pub fn nochange(&self) -> i64 {
        self.mask_unchanged_since.map(i64::from).unwrap_or(-1)
    }

    pub fn is_no_line(&self) -> bool {
        self.masklist == [NO_LINE]
    }
}

/// Column store holding one mask record per sample.
pub trait DataTable {
    fn sample_ids(&self) -> Vec<usize>;

    fn read_mask(&self, sample_id: usize) -> Option<SampleMask>;

    fn write_mask(&mut self, sample_id: usize, mask: SampleMask);

    /// Store `masklist` for `iteration`. From the second iteration on an
    /// identical mask is not rewritten; the record instead remembers the first
    /// iteration it stayed unchanged after. Returns whether the mask changed.
    fn update_mask(&mut self, sample_id: usize, masklist: Vec<[i32; 2]>, iteration: u32) -> bool {
        let mut record = self.read_mask(sample_id).unwrap_or_default();
        let unchanged = iteration > 1 && record.masklist == masklist;
        if unchanged {
            if record.mask_unchanged_since.is_none() {
                record.mask_unchanged_since = Some(iteration - 1);
            }
        } else {
            record.masklist = masklist;
            record.mask_unchanged_since = None;
        }
        self.write_mask(sample_id, record);
        !unchanged
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InMemoryTable {
    pub rows: BTreeMap<usize, SampleMask>,
}

impl InMemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with an empty record for every id.
    pub fn with_samples<I: IntoIterator<Item = usize>>(ids: I) -> Self {
        Self {
            rows: ids.into_iter().map(|id| (id, SampleMask::default())).collect(),
        }
    }

    pub fn masklist(&self, sample_id: usize) -> &[[i32; 2]] {
        self.rows
            .get(&sample_id)
            .map(|r| r.masklist.as_slice())
            .unwrap_or(&[])
    }

    /// NOCHANGE column, `-1` for unknown samples.
    pub fn nochange_column(&self) -> BTreeMap<usize, i64> {
        self.rows.iter().map(|(&id, r)| (id, r.nochange())).collect()
    }
}

impl DataTable for InMemoryTable {
    fn sample_ids(&self) -> Vec<usize> {
        self.rows.keys().cloned().collect()
    }

    fn read_mask(&self, sample_id: usize) -> Option<SampleMask> {
        self.rows.get(&sample_id).cloned()
    }

    fn write_mask(&mut self, sample_id: usize, mask: SampleMask) {
        self.rows.insert(sample_id, mask);
    }
}
