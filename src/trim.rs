//! Shrinking an input while keeping the chosen rare edge reachable.
//! Geometric schedule: large windows first, halving until the step falls
//! under a floor derived from the input size.

use crate::config::Config;
use crate::coverage::EdgeId;
use crate::executor::{ExecError, Executor};
use crate::stats::{FuzzerStats, StageId};
use crate::world::World;

#[derive(Clone, Copy, Debug, Default)]
pub struct TrimResult {
    pub trimmed: bool,
    pub stopped: bool,
}

/// Remove windows of bytes from `buf` as long as the target edge stays in
/// the trace. Crashes and timeouts during probing neither stop progress
/// nor count as findings; only an executor failure aborts.
pub fn trim_preserving_edge<E: Executor>(
    exec: &mut E,
    world: &World,
    cfg: &Config,
    stats: &mut FuzzerStats,
    buf: &mut Vec<u8>,
    target: EdgeId,
) -> Result<TrimResult, ExecError> {
    let mut result = TrimResult::default();
    if buf.len() < 5 {
        return Ok(result);
    }

    let len_p2 = buf.len().next_power_of_two();
    let mut remove_len = (len_p2 / cfg.trim_start_steps).max(cfg.trim_min_bytes);
    let min_step = (len_p2 / cfg.trim_end_steps).max(cfg.trim_min_bytes);

    let mut scratch: Vec<u8> = Vec::with_capacity(buf.len());
    while remove_len >= min_step {
        let mut pos = 0;
        while pos < buf.len() {
            if world.stop_requested() {
                result.stopped = true;
                return Ok(result);
            }
            let trim_avail = remove_len.min(buf.len() - pos);
            scratch.clear();
            scratch.extend_from_slice(&buf[..pos]);
            scratch.extend_from_slice(&buf[pos + trim_avail..]);

            exec.run(&scratch)?;
            stats.record_exec(StageId::Trim);

            if exec.trace_contains(target) {
                std::mem::swap(buf, &mut scratch);
                result.trimmed = true;
                // stay at this position; the tail shifted left into it
            } else {
                pos += remove_len;
            }
        }
        remove_len >>= 1;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::CountingExecutor;
    use crate::executor::ExecStatus;

    const TARGET: EdgeId = 9;

    /// Target edge fires iff the input contains the byte `b'!'`.
    fn marker_executor() -> CountingExecutor {
        CountingExecutor::new(16, |input, map| {
            map.record(0);
            if input.contains(&b'!') {
                map.record(TARGET);
            }
            ExecStatus::Ok
        })
    }

    #[test]
    fn trims_down_to_the_essential_byte() {
        let mut exec = marker_executor();
        let world = World::default();
        let cfg = Config {
            trim_min_bytes: 1,
            ..Config::default()
        };
        let mut stats = FuzzerStats::default();
        let mut buf = vec![b'a'; 100];
        buf.push(b'!');
        buf.extend(vec![b'b'; 30]);

        let result =
            trim_preserving_edge(&mut exec, &world, &cfg, &mut stats, &mut buf, TARGET).unwrap();
        assert!(result.trimmed);
        assert!(buf.contains(&b'!'));
        assert!(buf.len() < 16, "only shrank to {}", buf.len());
        assert!(stats.stage(StageId::Trim).execs > 0);
    }

    #[test]
    fn leaves_untrimmable_input_alone() {
        // every byte matters: the edge needs the full length
        let mut exec = CountingExecutor::new(16, |input, map| {
            if input.len() >= 8 {
                map.record(TARGET);
            }
            ExecStatus::Ok
        });
        let world = World::default();
        let cfg = Config::default();
        let mut stats = FuzzerStats::default();
        let mut buf = vec![b'x'; 8];
        let before = buf.clone();
        let result =
            trim_preserving_edge(&mut exec, &world, &cfg, &mut stats, &mut buf, TARGET).unwrap();
        assert!(!result.trimmed);
        assert_eq!(buf, before);
    }

    #[test]
    fn stop_signal_aborts_trimming() {
        let mut exec = marker_executor();
        let world = World::default();
        world.stop_signal().set();
        let cfg = Config::default();
        let mut stats = FuzzerStats::default();
        let mut buf = vec![b'!'; 64];
        let result =
            trim_preserving_edge(&mut exec, &world, &cfg, &mut stats, &mut buf, TARGET).unwrap();
        assert!(result.stopped);
        assert_eq!(exec.counters().total_execs, 0);
    }
}
