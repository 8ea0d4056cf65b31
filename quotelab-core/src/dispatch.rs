//! Simulation loop substrate: subjects and the priority-ordered dispatcher.
//!
//! A [`Subject`] is anything that produces events when told to advance one
//! tick. The [`Dispatcher`] walks all subjects in priority order once per
//! pass until every subject reports end-of-data. The broker runs before the
//! bar feed so its event handlers settle before the next feed advance.

use log::debug;

use crate::event::EventBus;

/// Fixed dispatch ordering. Lower runs first within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DispatchPriority {
    Broker,
    BarFeed,
    Last,
}

/// A participant in the simulation loop.
pub trait Subject {
    fn start(&mut self) {}

    fn stop(&mut self) {}

    /// True when this subject has no more events to dispatch.
    fn eof(&self) -> bool;

    /// Advance one tick. Returns true if at least one event was dispatched.
    fn dispatch(&mut self) -> bool;

    fn priority(&self) -> DispatchPriority {
        DispatchPriority::Last
    }
}

/// Outcome of one dispatcher pass over all subjects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// At least one subject dispatched an event.
    Dispatched,
    /// No subject had anything to do, but not all are at end-of-data.
    Idle,
    /// Every subject is at end-of-data (or the dispatcher was stopped).
    Eof,
}

/// Drives registered subjects until all of them run out of data.
pub struct Dispatcher {
    subjects: Vec<Box<dyn Subject>>,
    start_events: EventBus<()>,
    idle_events: EventBus<()>,
    stopped: bool,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            subjects: Vec::new(),
            start_events: EventBus::new(),
            idle_events: EventBus::new(),
            stopped: false,
        }
    }

    /// Registers a subject, keeping the list ordered by dispatch priority.
    /// Insertion order breaks ties.
    pub fn add_subject(&mut self, subject: Box<dyn Subject>) {
        self.subjects.push(subject);
        self.subjects.sort_by_key(|subject| subject.priority());
    }

    /// Emitted once, after all subjects have started.
    pub fn start_events(&self) -> EventBus<()> {
        self.start_events.clone()
    }

    /// Emitted on every pass where no subject dispatched anything.
    pub fn idle_events(&self) -> EventBus<()> {
        self.idle_events.clone()
    }

    /// Starts every subject and announces the run.
    pub fn start(&mut self) {
        debug!("dispatcher starting {} subject(s)", self.subjects.len());
        for subject in &mut self.subjects {
            subject.start();
        }
        self.start_events.emit(&());
    }

    /// Runs one pass over all subjects in priority order.
    pub fn step(&mut self) -> Step {
        if self.stopped {
            return Step::Eof;
        }
        let mut eof = true;
        let mut dispatched = false;
        for subject in &mut self.subjects {
            if !subject.eof() {
                eof = false;
                dispatched |= subject.dispatch();
            }
        }
        if eof {
            Step::Eof
        } else if dispatched {
            Step::Dispatched
        } else {
            self.idle_events.emit(&());
            Step::Idle
        }
    }

    /// Convenience loop: start, step to end-of-data, then stop subjects.
    pub fn run(&mut self) {
        self.start();
        while self.step() != Step::Eof {}
        self.finish();
    }

    /// Requests the loop to end; the next `step` reports `Eof`.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Stops every subject.
    pub fn finish(&mut self) {
        for subject in &mut self.subjects {
            subject.stop();
        }
        debug!("dispatcher finished");
    }
}
