//! The timeout monitor: a side task feeding periodic tick frames into a
//! node's priority queue. The command loop checks its wall-clock deadlines
//! (blocked time requests, outstanding queries, pings) against each tick.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::command::Command;
use crate::frame::{Action, ControlFrame};
use crate::queue::CommandSender;

pub struct TimeoutMonitor;

impl TimeoutMonitor {
    /// Spawn the tick producer; it stops once the node's queues close.
    pub fn spawn(sender: CommandSender, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if sender.send(Command::Frame(ControlFrame::new(Action::Tick))).is_err() {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;

    #[tokio::test(start_paused = true)]
    async fn ticks_arrive_periodically() {
        let (tx, mut rx) = queue::channel();
        let _handle = TimeoutMonitor::spawn(tx, Duration::from_millis(50));
        for _ in 0..3 {
            match rx.next().await.unwrap() {
                Command::Frame(frame) => assert_eq!(frame.action, Action::Tick),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_stops_when_the_queue_closes() {
        let (tx, rx) = queue::channel();
        let handle = TimeoutMonitor::spawn(tx, Duration::from_millis(10));
        drop(rx);
        handle.await.unwrap();
    }
}
