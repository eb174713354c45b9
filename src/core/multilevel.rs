//! Multi-level pollable: an ordered sequence of levels, each a set of
//! pollables polled in parallel, advancing only when the current level drains.
//!
//! Grounded on §4.5 and `original_source/cloudinitd/services.py`'s
//! level-sequencing composition (used there both by `BootTopLevel` across
//! services and inside `SVCContainer` across phases).

use crate::core::events::Event;
use crate::core::pollable::{PollOutcome, Pollable};
use crate::error::{Error, FailedMember, Result};

/// A named member of a level, so failures and progress can be attributed.
pub struct Member {
    pub label: String,
    pub pollable: Box<dyn Pollable>,
}

impl Member {
    pub fn new(label: impl Into<String>, pollable: Box<dyn Pollable>) -> Self {
        Self {
            label: label.into(),
            pollable,
        }
    }
}

/// Holds an ordered sequence of levels; each level is a set of [`Member`]s.
pub struct MultiLevelPollable {
    levels: Vec<Vec<Member>>,
    continue_on_error: bool,
    current_level: usize,
    active: Vec<Member>,
    started: bool,
    done: bool,
    pending_failures: Vec<FailedMember>,
    pending_events: Vec<Event>,
}

impl MultiLevelPollable {
    pub fn new(continue_on_error: bool) -> Self {
        Self {
            levels: Vec::new(),
            continue_on_error,
            current_level: 0,
            active: Vec::new(),
            started: false,
            done: false,
            pending_failures: Vec::new(),
            pending_events: Vec::new(),
        }
    }

    /// Appends a level. Only legal before `start`.
    pub fn add_level(&mut self, level: Vec<Member>) -> Result<()> {
        if self.started {
            return Err(Error::api_misuse("add_level called after start"));
        }
        self.levels.push(level);
        Ok(())
    }

    /// Reverses the level sequence. Only legal before `start`. Used for
    /// tear-down: level *n* first, level 0 last.
    pub fn reverse_order(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::api_misuse("reverse_order called after start"));
        }
        self.levels.reverse();
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn start_level(&mut self, index: usize) -> Result<()> {
        let level = std::mem::take(&mut self.levels[index]);
        let labels: Vec<String> = level.iter().map(|member| member.label.clone()).collect();
        for mut member in level {
            member.pollable.start()?;
            self.active.push(member);
        }
        self.pending_events.push(Event::LevelStarted {
            level_index: index,
            services: labels,
        });
        Ok(())
    }
}

impl Pollable for MultiLevelPollable {
    fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::api_misuse("multi-level pollable started twice"));
        }
        self.started = true;
        if self.levels.is_empty() {
            self.done = true;
            return Ok(());
        }
        self.start_level(0)
    }

    fn poll(&mut self) -> Result<PollOutcome> {
        if self.done {
            return Ok(PollOutcome::Done);
        }
        if !self.started {
            return Err(Error::api_misuse("multi-level pollable polled before start"));
        }

        let mut failed: Vec<FailedMember> = Vec::new();
        let mut still_active = Vec::with_capacity(self.active.len());

        let mut members = std::mem::take(&mut self.active).into_iter();
        while let Some(mut member) = members.next() {
            let outcome = member.pollable.poll();
            self.pending_events.extend(member.pollable.drain_events());
            match outcome {
                Ok(PollOutcome::Done) => {}
                Ok(PollOutcome::NotDone) => still_active.push(member),
                Err(err) => {
                    failed.push(FailedMember {
                        label: member.label.clone(),
                        source: Box::new(err),
                    });
                    if !self.continue_on_error {
                        member.pollable.cancel();
                        for mut sibling in still_active {
                            sibling.pollable.cancel();
                        }
                        // Members not yet reached this round are still live
                        // (e.g. a spawned child process) and must be
                        // cancelled too, not silently dropped.
                        for mut remaining in members {
                            remaining.pollable.cancel();
                        }
                        return Err(Error::MultilevelError { failed });
                    }
                }
            }
        }

        self.active = still_active;
        self.pending_failures.extend(failed);

        if !self.pending_failures.is_empty() {
            // continue_on_error=true: siblings already finished this round;
            // propagate once the level has fully drained.
            if self.active.is_empty() {
                return Err(Error::MultilevelError {
                    failed: std::mem::take(&mut self.pending_failures),
                });
            }
            return Ok(PollOutcome::NotDone);
        }

        if self.active.is_empty() {
            self.pending_events.push(Event::LevelCompleted {
                level_index: self.current_level,
            });
            self.current_level += 1;
            if self.current_level >= self.levels.len() {
                self.done = true;
                return Ok(PollOutcome::Done);
            }
            self.start_level(self.current_level)?;
        }

        Ok(PollOutcome::NotDone)
    }

    fn cancel(&mut self) {
        for member in &mut self.active {
            member.pollable.cancel();
        }
        self.active.clear();
        for level in &mut self.levels[self.current_level..] {
            for member in level {
                member.pollable.cancel();
            }
        }
        self.done = true;
    }

    fn drain_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }
}
