use log::debug;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::consensus::state::{StateMachineHandle, StateMachineMessage};
use crate::consensus::types::RoundStepType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutInfo {
    pub duration: Duration,
    pub height: u64,
    pub round: u32,
    pub step: RoundStepType,
}

impl TimeoutInfo {
    pub fn new(duration: Duration, height: u64, round: u32, step: RoundStepType) -> Self {
        Self {
            duration,
            height,
            round,
            step,
        }
    }

    fn position(&self) -> (u64, u32, RoundStepType) {
        (self.height, self.round, self.step)
    }
}

/// Single pending timer. A new timeout replaces the pending one only when
/// its (height, round, step) is strictly later than the last scheduled.
pub struct TimeoutTicker {
    handle: StateMachineHandle,
    last: Option<TimeoutInfo>,
    timer: Option<JoinHandle<()>>,
}

impl TimeoutTicker {
    pub fn new(handle: StateMachineHandle) -> Self {
        Self {
            handle,
            last: None,
            timer: None,
        }
    }

    /// Returns false when `ti` is not later than the last scheduled timeout.
    pub fn schedule(&mut self, ti: TimeoutInfo) -> bool {
        if let Some(last) = &self.last {
            if ti.position() <= last.position() {
                debug!(
                    "Ignoring timeout {}/{}/{}, already scheduled {}/{}/{}",
                    ti.height, ti.round, ti.step, last.height, last.round, last.step
                );
                return false;
            }
        }

        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let handle = self.handle.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(ti.duration).await;
            handle.send(StateMachineMessage::Timeout(ti)).await;
        }));
        self.last = Some(ti);
        true
    }

    pub fn stop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for TimeoutTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn ti(ms: u64, height: u64, round: u32, step: RoundStepType) -> TimeoutInfo {
        TimeoutInfo::new(Duration::from_millis(ms), height, round, step)
    }

    #[tokio::test(start_paused = true)]
    async fn later_timeout_replaces_pending_one() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut ticker = TimeoutTicker::new(StateMachineHandle::new(tx));

        assert!(ticker.schedule(ti(1000, 1, 0, RoundStepType::Propose)));
        assert!(ticker.schedule(ti(500, 1, 0, RoundStepType::PrevoteWait)));

        match rx.recv().await {
            Some(StateMachineMessage::Timeout(fired)) => {
                assert_eq!(fired.step, RoundStepType::PrevoteWait)
            }
            _ => panic!("expected timeout"),
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_or_equal_timeout_is_ignored() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut ticker = TimeoutTicker::new(StateMachineHandle::new(tx));

        assert!(ticker.schedule(ti(100, 2, 1, RoundStepType::Precommit)));
        assert!(!ticker.schedule(ti(10, 2, 1, RoundStepType::Precommit)));
        assert!(!ticker.schedule(ti(10, 2, 0, RoundStepType::Commit)));
        assert!(!ticker.schedule(ti(10, 1, 9, RoundStepType::Commit)));

        match rx.recv().await {
            Some(StateMachineMessage::Timeout(fired)) => {
                assert_eq!((fired.height, fired.round, fired.step), (2, 1, RoundStepType::Precommit));
                assert_eq!(fired.duration, Duration::from_millis(100));
            }
            _ => panic!("expected timeout"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_timer() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut ticker = TimeoutTicker::new(StateMachineHandle::new(tx));
        ticker.schedule(ti(100, 1, 0, RoundStepType::Propose));
        ticker.stop();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }
}
