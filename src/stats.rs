//! Counters the core maintains while fuzzing. The core never formats
//! messages itself; it updates these values and lets [`World`](crate::world::World)
//! render them.

use std::fmt;

/// Identifies a mutation stage for statistics attribution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageId {
    Calibrate,
    Trim,
    BranchMask,
    Flip1,
    Flip2,
    Flip4,
    Flip8,
    Flip16,
    Flip32,
    Arith8,
    Arith16,
    Arith32,
    Interest8,
    Interest16,
    Interest32,
    ExtrasUserOverwrite,
    ExtrasUserInsert,
    ExtrasAutoOverwrite,
    Havoc,
    Splice,
}

impl StageId {
    pub const COUNT: usize = 20;

    pub fn name(self) -> &'static str {
        match self {
            StageId::Calibrate => "calibrate",
            StageId::Trim => "trim",
            StageId::BranchMask => "branch mask",
            StageId::Flip1 => "bitflip 1/1",
            StageId::Flip2 => "bitflip 2/1",
            StageId::Flip4 => "bitflip 4/1",
            StageId::Flip8 => "bitflip 8/8",
            StageId::Flip16 => "bitflip 16/8",
            StageId::Flip32 => "bitflip 32/8",
            StageId::Arith8 => "arith 8/8",
            StageId::Arith16 => "arith 16/8",
            StageId::Arith32 => "arith 32/8",
            StageId::Interest8 => "interest 8/8",
            StageId::Interest16 => "interest 16/8",
            StageId::Interest32 => "interest 32/8",
            StageId::ExtrasUserOverwrite => "user extras (over)",
            StageId::ExtrasUserInsert => "user extras (insert)",
            StageId::ExtrasAutoOverwrite => "auto extras (over)",
            StageId::Havoc => "havoc",
            StageId::Splice => "splice",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Executions and finds attributed to one stage. `skipped` counts
/// candidates a redundancy predicate or gate ruled out without a run.
#[derive(Clone, Copy, Default)]
pub struct StageStats {
    pub execs: usize,
    pub finds: usize,
    pub skipped: usize,
}

/// Events worth surfacing to the outer program.
#[derive(Clone, Copy)]
pub enum FuzzerEvent {
    Start,
    Pulse,
    SeedDone,
    SeedSkipped,
    EdgeBlacklisted(usize),
    RareExponentTightened(u32),
    Stop,
}

/// Rolling statistics for a fuzzing run.
#[derive(Clone)]
pub struct FuzzerStats {
    pub total_execs: usize,
    pub seeds_fuzzed: usize,
    pub seeds_skipped: usize,
    pub havoc_rewards: usize,
    pub blacklist_size: usize,
    pub rare_branch_exp: u32,
    stages: [StageStats; StageId::COUNT],
}

impl Default for FuzzerStats {
    fn default() -> Self {
        Self {
            total_execs: 0,
            seeds_fuzzed: 0,
            seeds_skipped: 0,
            havoc_rewards: 0,
            blacklist_size: 0,
            rare_branch_exp: u32::MAX,
            stages: [StageStats::default(); StageId::COUNT],
        }
    }
}

impl FuzzerStats {
    pub fn stage(&self, id: StageId) -> &StageStats {
        &self.stages[id.index()]
    }
    pub fn stage_mut(&mut self, id: StageId) -> &mut StageStats {
        &mut self.stages[id.index()]
    }
    pub fn record_exec(&mut self, id: StageId) {
        self.total_execs += 1;
        self.stages[id.index()].execs += 1;
    }
    pub fn record_finds(&mut self, id: StageId, finds: usize) {
        self.stages[id.index()].finds += finds;
    }
    pub fn record_skip(&mut self, id: StageId) {
        self.stages[id.index()].skipped += 1;
    }
}

impl fmt::Display for FuzzerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "execs: {}\tfuzzed: {}\tskipped: {}\tblacklist: {}",
            self.total_execs, self.seeds_fuzzed, self.seeds_skipped, self.blacklist_size
        )
    }
}

pub enum CSVField {
    Integer(isize),
    Float(f64),
    String(String),
}

impl CSVField {
    pub fn to_bytes(fields: &[CSVField]) -> Vec<u8> {
        let mut bytes = vec![];
        for field in fields {
            match field {
                CSVField::Integer(n) => {
                    bytes.extend(format!("{}", n).as_bytes());
                }
                CSVField::Float(f) => {
                    bytes.extend(format!("{:.4}", f).as_bytes());
                }
                CSVField::String(s) => {
                    bytes.extend(format!("{:?}", s).as_bytes());
                }
            }
            bytes.extend(b",");
        }
        bytes.extend(b"\n");
        bytes
    }
}

/// Describes how to save a list of this value as rows of a CSV file.
pub trait ToCSV {
    fn csv_headers(&self) -> Vec<CSVField>;
    fn to_csv_record(&self) -> Vec<CSVField>;
}

impl ToCSV for FuzzerStats {
    fn csv_headers(&self) -> Vec<CSVField> {
        let mut headers = vec![
            CSVField::String("total_execs".to_string()),
            CSVField::String("seeds_fuzzed".to_string()),
            CSVField::String("seeds_skipped".to_string()),
            CSVField::String("havoc_rewards".to_string()),
            CSVField::String("blacklist_size".to_string()),
            CSVField::String("rare_branch_exp".to_string()),
        ];
        for id in ALL_STAGES {
            headers.push(CSVField::String(format!("{}_execs", id.name())));
            headers.push(CSVField::String(format!("{}_finds", id.name())));
        }
        headers
    }

    fn to_csv_record(&self) -> Vec<CSVField> {
        let mut record = vec![
            CSVField::Integer(self.total_execs as isize),
            CSVField::Integer(self.seeds_fuzzed as isize),
            CSVField::Integer(self.seeds_skipped as isize),
            CSVField::Integer(self.havoc_rewards as isize),
            CSVField::Integer(self.blacklist_size as isize),
            CSVField::Integer(self.rare_branch_exp as isize),
        ];
        for id in ALL_STAGES {
            let s = self.stage(id);
            record.push(CSVField::Integer(s.execs as isize));
            record.push(CSVField::Integer(s.finds as isize));
        }
        record
    }
}

const ALL_STAGES: [StageId; StageId::COUNT] = [
    StageId::Calibrate,
    StageId::Trim,
    StageId::BranchMask,
    StageId::Flip1,
    StageId::Flip2,
    StageId::Flip4,
    StageId::Flip8,
    StageId::Flip16,
    StageId::Flip32,
    StageId::Arith8,
    StageId::Arith16,
    StageId::Arith32,
    StageId::Interest8,
    StageId::Interest16,
    StageId::Interest32,
    StageId::ExtrasUserOverwrite,
    StageId::ExtrasUserInsert,
    StageId::ExtrasAutoOverwrite,
    StageId::Havoc,
    StageId::Splice,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_record_matches_headers() {
        let mut stats = FuzzerStats::default();
        stats.record_exec(StageId::Havoc);
        stats.record_finds(StageId::Havoc, 2);
        assert_eq!(stats.csv_headers().len(), stats.to_csv_record().len());
        assert_eq!(stats.stage(StageId::Havoc).execs, 1);
        assert_eq!(stats.stage(StageId::Havoc).finds, 2);
    }
}
