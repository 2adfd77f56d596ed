//! The staged deserialization scheduler (spec §4.9): decoding a type
//! definition can require resolving another type that is itself still being
//! defined (mutually recursive generics, a field typed as its own
//! containing type). Rather than recursing straight through, decode work is
//! queued into one of four ordered stages and drained breadth-first so every
//! stage completes for every pending type before the next stage starts.
//!
//! Grounded on `llvm-bitcode::visitor::CollectingVisitor`'s stack-of-lists:
//! it defers "append this record" into per-block lists and flushes them in
//! a fixed order on `exit_block`, rather than acting immediately inside
//! `visit_record`. The scheduler generalizes that to four stages instead of
//! one flush point, and to closures instead of records.

use std::collections::VecDeque;

use crate::error::Error;
use crate::reflect::ReflectionFacade;

/// Spec §4.9: each deferred unit of work belongs to exactly one stage, and
/// stages always drain in this order for a given decode pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Stage {
    /// Allocate the bare handle so later stages can reference it.
    Declare = 0,
    /// Wire up parent/interfaces/generic parameters.
    Shape = 1,
    /// Define members (fields/methods/properties/events).
    Members = 2,
    /// Seal the type (`create_type`) and apply custom attributes.
    Seal = 3,
}

impl Stage {
    const COUNT: usize = 4;

    #[must_use]
    pub fn all() -> [Stage; Self::COUNT] {
        [Stage::Declare, Stage::Shape, Stage::Members, Stage::Seal]
    }
}

type Deferred<'a> = Box<dyn FnOnce(&mut dyn ReflectionFacade) -> Result<(), Error> + 'a>;

/// Four ordered FIFO queues of deferred work, one per [`Stage`].
#[derive(Default)]
pub struct Scheduler<'a> {
    queues: [VecDeque<Deferred<'a>>; Stage::COUNT],
    current: Option<Stage>,
}

impl<'a> Scheduler<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: Default::default(),
            current: None,
        }
    }

    /// Defers `work` until `stage`'s turn. Enforces that a caller inside an
    /// earlier or the same stage cannot defer into an already-drained
    /// stage's past (spec §4.9: "no stage may be entered out of order").
    pub fn defer(
        &mut self,
        stage: Stage,
        work: impl FnOnce(&mut dyn ReflectionFacade) -> Result<(), Error> + 'a,
    ) -> Result<(), Error> {
        if let Some(current) = self.current {
            if stage < current {
                return Err(Error::StageOrderViolation {
                    from: current as u8,
                    into: stage as u8,
                });
            }
        }
        self.queues[stage as usize].push_back(Box::new(work));
        Ok(())
    }

    /// Whether every stage queue is empty (spec §4.9: the driver asserts
    /// this at end-of-stream).
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    /// Drains every stage in order, running each stage's queue to
    /// completion (including work newly deferred by that stage's own
    /// closures) before moving to the next.
    pub fn run(&mut self, host: &mut dyn ReflectionFacade) -> Result<(), Error> {
        for stage in Stage::all() {
            self.current = Some(stage);
            log::trace!("scheduler: entering {stage:?} with {} deferred", self.queues[stage as usize].len());
            // A closure run in this stage may itself `defer` more work into
            // this same stage, so keep draining until the queue is empty
            // rather than taking one fixed-length snapshot.
            while let Some(work) = self.queues[stage as usize].pop_front() {
                work(host)?;
            }
        }
        self.current = None;
        Ok(())
    }
}
