//! The boundary between the core and the terminal. Holds the stop signal
//! polled between executions and renders [`FuzzerEvent`]s with a splash of
//! color; nothing else in the crate prints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nu_ansi_term::Color;

use crate::stats::{FuzzerEvent, FuzzerStats};

/// Cloneable handle that an outer signal handler can set to interrupt the
/// current seed between executions.
#[derive(Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
    pub fn clear(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct World {
    stop: StopSignal,
    initial_instant: Instant,
    checkpoint_instant: Instant,
    /// When false, events are counted but not printed.
    verbose: bool,
}

impl World {
    pub fn new(verbose: bool) -> Self {
        Self {
            stop: StopSignal::new(),
            initial_instant: Instant::now(),
            checkpoint_instant: Instant::now(),
            verbose,
        }
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_set()
    }

    pub fn set_checkpoint_instant(&mut self) {
        self.checkpoint_instant = Instant::now();
    }

    pub fn elapsed_time_since_start(&self) -> usize {
        self.initial_instant.elapsed().as_micros() as usize
    }

    pub fn elapsed_time_since_last_checkpoint(&self) -> usize {
        self.checkpoint_instant.elapsed().as_micros() as usize
    }

    pub fn report_event(&self, event: FuzzerEvent, stats: Option<&FuzzerStats>) {
        if !self.verbose {
            return;
        }
        match event {
            FuzzerEvent::Start => {
                println!("{}", Color::Green.paint("START"));
                return;
            }
            FuzzerEvent::Stop => {
                println!("\n{}", Color::Red.paint("======== STOPPED ========"));
                return;
            }
            FuzzerEvent::Pulse => print!("{}\t", Color::Yellow.paint("PULSE")),
            FuzzerEvent::SeedDone => print!("{}\t", Color::Green.paint("DONE")),
            FuzzerEvent::SeedSkipped => print!("{}\t", Color::DarkGray.paint("SKIP")),
            FuzzerEvent::EdgeBlacklisted(edge) => {
                print!("{} {}\t", Color::Red.paint("BLACKLIST"), edge)
            }
            FuzzerEvent::RareExponentTightened(exp) => {
                print!("{} {}\t", Color::Blue.paint("RARE_EXP"), exp)
            }
        }
        if let Some(stats) = stats {
            println!("{}", stats);
        } else {
            println!();
        }
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_signal_round_trip() {
        let world = World::default();
        let signal = world.stop_signal();
        assert!(!world.stop_requested());
        signal.set();
        assert!(world.stop_requested());
        signal.clear();
        assert!(!world.stop_requested());
    }
}
