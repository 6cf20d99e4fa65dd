//! Start-sequence reaction to agent commands.
//!
//! [`ReadyTracker::react`] decides what a command means for a task that is
//! starting or running, without performing any I/O. The coordinator applies
//! the returned [`Reaction`].

use crate::models::command::AgentCommand;

/// What the coordinator must do in response to one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Bookkeeping only; forward the command.
    Forward,
    /// The agent finished retransforming; commit the session.
    Ready,
    /// The agent is exiting; release the caller and run the stop sequence.
    Exit {
        /// Agent exit code.
        code: i32,
    },
    /// Retransformation began; record the class count.
    Retransforming {
        /// Classes being retransformed.
        num_classes: u32,
    },
}

/// Tracks whether a success acknowledgment means "session ready".
///
/// The agent acknowledges compilation with a success before it starts
/// retransforming; only a success that follows a retransformation-start
/// commits the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadyTracker {
    retransforming: bool,
}

impl ReadyTracker {
    /// Whether a retransformation-start was seen without its success yet.
    #[must_use]
    pub fn is_retransforming(&self) -> bool {
        self.retransforming
    }

    /// Update the tracker for `command` and return the reaction.
    pub fn react(&mut self, command: &AgentCommand) -> Reaction {
        match command {
            AgentCommand::Success if self.retransforming => {
                self.retransforming = false;
                Reaction::Ready
            }
            AgentCommand::Exit { code } => Reaction::Exit { code: *code },
            AgentCommand::RetransformationStart { num_classes } => {
                self.retransforming = true;
                Reaction::Retransforming {
                    num_classes: *num_classes,
                }
            }
            _ => Reaction::Forward,
        }
    }
}
