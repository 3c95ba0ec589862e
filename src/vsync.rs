//! Vsync feedback for in-flight mode switches
//!
//! After a commit carrying a new mode, [`VsyncReconciler`] watches the
//! interval between hardware vsync events. The switch counts as applied once
//! the observed period is within 20% of the desired one, or once the panel's
//! refresh-rate transition time has elapsed since the mode-set frame reached
//! the screen.
//!
//! When the mode-set commit returned a retire fence, the frame reached the
//! screen when that fence signaled. Without one, the first vsync after the
//! commit stands in for it.

use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use tracing::{debug, info, trace};

/// State of the fence tracking the frame that carried the mode set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSetFence {
    None,
    /// Committed, not yet on screen
    Pending,
    /// On screen since the given vsync timestamp
    Signaled(i64),
}

#[derive(Debug)]
pub struct VsyncReconciler {
    last_timestamp: Option<i64>,
    vsync_period: i64,
    desired_period: Option<i64>,
    transient_duration: u32,
    fence: ModeSetFence,
    retire_fence: Option<OwnedFd>,
}

impl VsyncReconciler {
    pub fn new(transient_duration: u32) -> Self {
        Self {
            last_timestamp: None,
            vsync_period: 0,
            desired_period: None,
            transient_duration,
            fence: ModeSetFence::None,
            retire_fence: None,
        }
    }

    /// Vsync periods a refresh-rate switch may take to settle
    pub fn set_transient_duration(&mut self, duration: u32) {
        self.transient_duration = duration;
    }

    pub fn transient_duration(&self) -> u32 {
        self.transient_duration
    }

    /// Start waiting for `period` after a mode-set commit, optionally with
    /// the retire fence of that commit
    pub fn arm(&mut self, period: i64, retire_fence: Option<OwnedFd>) {
        debug!(
            "Waiting for vsync period {}ns (retire fence: {})",
            period,
            retire_fence.is_some()
        );
        self.desired_period = Some(period);
        self.fence = ModeSetFence::Pending;
        self.retire_fence = retire_fence;
    }

    /// Retire fence of the mode-set frame while it is not known to be on
    /// screen
    pub fn pending_retire_fence(&self) -> Option<BorrowedFd<'_>> {
        match self.fence {
            ModeSetFence::Pending => self.retire_fence.as_ref().map(AsFd::as_fd),
            _ => None,
        }
    }

    /// The mode-set frame reached the screen at `signal_time`
    pub fn fence_signaled(&mut self, signal_time: i64) {
        if self.fence == ModeSetFence::Pending {
            trace!("Mode set frame on screen at {}", signal_time);
            self.fence = ModeSetFence::Signaled(signal_time);
        }
        self.retire_fence = None;
    }

    pub fn desired_period(&self) -> Option<i64> {
        self.desired_period
    }

    pub fn reset_desired_period(&mut self) {
        self.desired_period = None;
        self.fence = ModeSetFence::None;
        self.retire_fence = None;
    }

    /// Seed the measured period, e.g. after an immediate mode set
    pub fn set_vsync_period(&mut self, period: i64) {
        self.vsync_period = period;
    }

    pub fn vsync_period(&self) -> i64 {
        self.vsync_period
    }

    /// Forget the last timestamp; the next event only re-seeds it
    pub fn reset_timestamp(&mut self) {
        self.last_timestamp = None;
    }

    pub fn fence(&self) -> ModeSetFence {
        self.fence
    }

    /// Feed one vsync timestamp
    ///
    /// Returns true when no switch is outstanding or the outstanding one has
    /// taken effect.
    pub fn on_vsync(&mut self, timestamp: i64) -> bool {
        if let Some(last) = self.last_timestamp {
            self.vsync_period = timestamp - last;
        }
        self.last_timestamp = Some(timestamp);

        if self.fence == ModeSetFence::Pending && self.retire_fence.is_none() {
            self.fence = ModeSetFence::Signaled(timestamp);
        }

        let Some(desired) = self.desired_period else {
            return true;
        };

        let error = desired / 5;
        if (desired - self.vsync_period).abs() < error {
            trace!("Received the desired vsync period {}ns", desired);
            return true;
        }

        if let ModeSetFence::Signaled(signal_time) = self.fence {
            let deadline =
                signal_time + self.vsync_period * i64::from(self.transient_duration) - error;
            if timestamp > deadline {
                info!(
                    "Over the refresh rate switch duration: timestamp {} signal {} period {} desired {} transient {}",
                    timestamp, signal_time, self.vsync_period, desired, self.transient_duration
                );
                self.fence = ModeSetFence::None;
                self.retire_fence = None;
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    const MS: i64 = 1_000_000;

    #[test]
    fn test_no_pending_switch_is_applied() {
        let mut vsync = VsyncReconciler::new(2);
        assert!(vsync.on_vsync(0));
        assert!(vsync.on_vsync(16 * MS));
        assert_eq!(vsync.vsync_period(), 16 * MS);
    }

    #[test]
    fn test_converges_within_twenty_percent() {
        let mut vsync = VsyncReconciler::new(2);
        vsync.on_vsync(0);
        vsync.arm(8_333_333, None);

        assert!(!vsync.on_vsync(16_600_000));
        assert_eq!(vsync.fence(), ModeSetFence::Signaled(16_600_000));
        assert!(!vsync.on_vsync(33_200_000));
        assert!(vsync.on_vsync(41_500_000));
    }

    #[test]
    fn test_times_out_after_transient_duration() {
        let mut vsync = VsyncReconciler::new(2);
        vsync.on_vsync(0);
        vsync.arm(8_333_333, None);

        // The panel keeps running at 60Hz
        let mut ts = 0;
        let mut applied_at = None;
        for frame in 1..10 {
            ts += 16_666_666;
            if vsync.on_vsync(ts) {
                applied_at = Some(frame);
                break;
            }
        }
        // Signalled on frame 1; deadline is two periods later minus margin
        assert_eq!(applied_at, Some(3));
        assert_eq!(vsync.fence(), ModeSetFence::None);
    }

    #[test]
    fn test_first_timestamp_only_seeds() {
        let mut vsync = VsyncReconciler::new(2);
        vsync.set_vsync_period(16 * MS);
        vsync.arm(16 * MS, None);
        // The seeded period already matches
        assert!(vsync.on_vsync(100 * MS));

        vsync.reset_desired_period();
        vsync.reset_timestamp();
        vsync.arm(8 * MS, None);
        assert!(!vsync.on_vsync(200 * MS));
        assert_eq!(vsync.vsync_period(), 16 * MS);
    }

    fn retire_fence() -> OwnedFd {
        OwnedFd::from(File::open("/dev/null").unwrap())
    }

    #[test]
    fn test_retire_fence_replaces_first_vsync() {
        let mut vsync = VsyncReconciler::new(2);
        vsync.on_vsync(0);
        vsync.arm(8_333_333, Some(retire_fence()));

        // Still at 60Hz and the frame is not on screen yet
        assert!(!vsync.on_vsync(16_600_000));
        assert_eq!(vsync.fence(), ModeSetFence::Pending);
        assert!(vsync.pending_retire_fence().is_some());

        vsync.fence_signaled(33_000_000);
        assert_eq!(vsync.fence(), ModeSetFence::Signaled(33_000_000));
        assert!(vsync.pending_retire_fence().is_none());

        // Deadline 33.0 + 2 * 16.6 - 1.67 ms
        assert!(!vsync.on_vsync(33_200_000));
        assert!(!vsync.on_vsync(49_800_000));
        assert!(vsync.on_vsync(66_400_000));
        assert_eq!(vsync.fence(), ModeSetFence::None);
    }

    #[test]
    fn test_retire_fence_dropped_on_reset() {
        let mut vsync = VsyncReconciler::new(2);
        vsync.arm(8_333_333, Some(retire_fence()));
        vsync.reset_desired_period();
        assert!(vsync.pending_retire_fence().is_none());

        // A late signal for a cancelled switch changes nothing
        vsync.fence_signaled(10 * MS);
        assert_eq!(vsync.fence(), ModeSetFence::None);
    }
}
