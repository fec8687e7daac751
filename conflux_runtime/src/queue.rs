//! Ingress queues for a node's command-processing task.
//!
//! Every node owns one priority and one normal queue. The command loop pops
//! priority commands first; within each class, FIFO. Commands from a given
//! sender arrive in posting order because each class is a single channel.

use tokio::sync::mpsc;

use crate::command::Command;

/// Sending half, shared by routes, user-facing links and the timeout monitor.
#[derive(Debug, Clone)]
pub struct CommandSender {
    priority: mpsc::UnboundedSender<Command>,
    normal: mpsc::UnboundedSender<Command>,
}

impl CommandSender {
    /// Enqueue a command, classifying it by its frame action (non-frame
    /// commands are always normal: they are user-op hand-offs).
    pub fn send(&self, command: Command) -> Result<(), ClosedError> {
        let priority = match &command {
            Command::Frame(frame) | Command::Routed { frame, .. } => frame.is_priority(),
            _ => false,
        };
        let target = if priority { &self.priority } else { &self.normal };
        target.send(command).map_err(|_| ClosedError)
    }
}

/// The receiving half, owned exclusively by the command task.
#[derive(Debug)]
pub struct CommandReceiver {
    priority: mpsc::UnboundedReceiver<Command>,
    normal: mpsc::UnboundedReceiver<Command>,
}

#[derive(Debug, thiserror::Error)]
#[error("command queue closed")]
pub struct ClosedError;

impl CommandReceiver {
    /// Pop the next command, draining the priority queue before the normal
    /// one. Returns `None` once both channels are closed and drained.
    pub async fn next(&mut self) -> Option<Command> {
        loop {
            // Anything already buffered on the priority channel wins.
            match self.priority.try_recv() {
                Ok(cmd) => return Some(cmd),
                Err(mpsc::error::TryRecvError::Empty)
                | Err(mpsc::error::TryRecvError::Disconnected) => {}
            }
            tokio::select! {
                biased;
                cmd = self.priority.recv() => {
                    if let Some(cmd) = cmd {
                        return Some(cmd);
                    }
                    // Priority side closed; fall through to drain normal.
                    return self.normal.recv().await;
                }
                cmd = self.normal.recv() => return cmd,
            }
        }
    }
}

/// Create a linked sender/receiver pair.
pub fn channel() -> (CommandSender, CommandReceiver) {
    let (ptx, prx) = mpsc::unbounded_channel();
    let (ntx, nrx) = mpsc::unbounded_channel();
    (
        CommandSender {
            priority: ptx,
            normal: ntx,
        },
        CommandReceiver {
            priority: prx,
            normal: nrx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Action, ControlFrame};

    #[tokio::test]
    async fn priority_commands_preempt_normal_ones() {
        let (tx, mut rx) = channel();
        tx.send(Command::Frame(ControlFrame::new(Action::Message)))
            .unwrap();
        tx.send(Command::Frame(ControlFrame::new(Action::Message)))
            .unwrap();
        tx.send(Command::Frame(ControlFrame::new(Action::Disconnect)))
            .unwrap();

        let first = rx.next().await.unwrap();
        match first {
            Command::Frame(frame) => assert_eq!(frame.action, Action::Disconnect),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn fifo_within_a_class() {
        let (tx, mut rx) = channel();
        for id in 0..4u32 {
            tx.send(Command::Frame(
                ControlFrame::new(Action::Message).message_id(id),
            ))
            .unwrap();
        }
        for id in 0..4u32 {
            match rx.next().await.unwrap() {
                Command::Frame(frame) => assert_eq!(frame.message_id, id),
                other => panic!("unexpected command {other:?}"),
            }
        }
    }
}
