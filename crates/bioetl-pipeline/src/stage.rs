//! Run lifecycle: `Init → Extract → Transform → Validate → Write → Done`,
//! with `Failed` reachable from any non-terminal stage.

use std::fmt;

use serde::Serialize;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Init,
    Extract,
    Transform,
    Validate,
    Write,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init      => "init",
            Stage::Extract   => "extract",
            Stage::Transform => "transform",
            Stage::Validate  => "validate",
            Stage::Write     => "write",
            Stage::Done      => "done",
            Stage::Failed    => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    fn successor(&self) -> Option<Stage> {
        match self {
            Stage::Init      => Some(Stage::Extract),
            Stage::Extract   => Some(Stage::Transform),
            Stage::Transform => Some(Stage::Validate),
            Stage::Validate  => Some(Stage::Write),
            Stage::Write     => Some(Stage::Done),
            Stage::Done | Stage::Failed => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the current stage and refuses illegal moves.
#[derive(Debug, Clone)]
pub struct StageMachine {
    current: Stage,
}

impl Default for StageMachine {
    fn default() -> Self {
        Self { current: Stage::Init }
    }
}

impl StageMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Stage {
        self.current
    }

    pub fn advance(&mut self, to: Stage) -> Result<Stage> {
        let legal = if to == Stage::Failed {
            !self.current.is_terminal()
        } else {
            self.current.successor() == Some(to)
        };
        if !legal {
            return Err(PipelineError::Transition { from: self.current, to });
        }
        self.current = to;
        Ok(to)
    }

    /// Mark the run failed, returning the stage it failed in.
    pub fn fail(&mut self) -> Stage {
        let at = self.current;
        if !at.is_terminal() {
            self.current = Stage::Failed;
        }
        at
    }
}
