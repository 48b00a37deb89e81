use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Wall-clock time as fractional epoch seconds. All scheduling targets and
/// drift measurements use this representation.
pub fn wall_clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("clock source unavailable: {0}")]
    Unavailable(String),
    #[error("clock rejected operation: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Stopped,
    Rolling,
    Starting,
}

impl TransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::Stopped => "stopped",
            TransportState::Rolling => "rolling",
            TransportState::Starting => "starting",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(TransportState::Stopped),
            "rolling" => Some(TransportState::Rolling),
            "starting" => Some(TransportState::Starting),
            _ => None,
        }
    }
}

/// Last-known transport position, produced by the agent's poll loop.
/// Not historized; each snapshot replaces the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransportSnapshot {
    pub state: TransportState,
    pub frame: u64,
    pub timestamp: f64,
}

/// Interface to the local real-time transport. Implementations wrap whatever
/// actually owns the playhead (an audio engine, a media player, or the
/// built-in [`SoftwareClock`]).
pub trait ClockSource: Send + Sync {
    fn start(&self) -> Result<(), ClockError>;
    fn stop(&self) -> Result<(), ClockError>;
    fn locate(&self, frame: u64) -> Result<(), ClockError>;
    fn query(&self) -> Result<(TransportState, u64), ClockError>;
}

#[derive(Debug)]
struct SoftwareClockInner {
    state: TransportState,
    base_frame: u64,
    rolled_at: Option<Instant>,
}

/// Frame counter driven by wall time. Frames advance at `sample_rate` only
/// while rolling; locate rebases the counter.
#[derive(Debug)]
pub struct SoftwareClock {
    sample_rate: u32,
    inner: Mutex<SoftwareClockInner>,
}

impl SoftwareClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            inner: Mutex::new(SoftwareClockInner {
                state: TransportState::Stopped,
                base_frame: 0,
                rolled_at: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SoftwareClockInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_frame(&self, inner: &SoftwareClockInner) -> u64 {
        match inner.rolled_at {
            Some(rolled_at) => {
                let elapsed = rolled_at.elapsed().as_secs_f64();
                inner.base_frame + (elapsed * f64::from(self.sample_rate)) as u64
            }
            None => inner.base_frame,
        }
    }
}

impl Default for SoftwareClock {
    fn default() -> Self {
        Self::new(48_000)
    }
}

impl ClockSource for SoftwareClock {
    fn start(&self) -> Result<(), ClockError> {
        let mut inner = self.lock();
        if inner.state != TransportState::Rolling {
            inner.state = TransportState::Rolling;
            inner.rolled_at = Some(Instant::now());
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), ClockError> {
        let mut inner = self.lock();
        inner.base_frame = self.current_frame(&inner);
        inner.rolled_at = None;
        inner.state = TransportState::Stopped;
        Ok(())
    }

    fn locate(&self, frame: u64) -> Result<(), ClockError> {
        let mut inner = self.lock();
        inner.base_frame = frame;
        if inner.state == TransportState::Rolling {
            inner.rolled_at = Some(Instant::now());
        }
        Ok(())
    }

    fn query(&self) -> Result<(TransportState, u64), ClockError> {
        let inner = self.lock();
        Ok((inner.state, self.current_frame(&inner)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn starts_stopped_at_frame_zero() {
        let clock = SoftwareClock::new(48_000);
        let (state, frame) = clock.query().unwrap();
        assert_eq!(state, TransportState::Stopped);
        assert_eq!(frame, 0);
    }

    #[test]
    fn frames_advance_only_while_rolling() {
        let clock = SoftwareClock::new(48_000);
        clock.start().unwrap();
        sleep(Duration::from_millis(50));
        let (_, frame_a) = clock.query().unwrap();
        assert!(frame_a > 0);

        clock.stop().unwrap();
        let (state, frame_b) = clock.query().unwrap();
        sleep(Duration::from_millis(50));
        let (_, frame_c) = clock.query().unwrap();
        assert_eq!(state, TransportState::Stopped);
        assert_eq!(frame_b, frame_c);
    }

    #[test]
    fn locate_rebases_frame_counter() {
        let clock = SoftwareClock::new(48_000);
        clock.locate(96_000).unwrap();
        let (_, frame) = clock.query().unwrap();
        assert_eq!(frame, 96_000);

        clock.start().unwrap();
        clock.locate(10_000).unwrap();
        sleep(Duration::from_millis(20));
        let (state, frame) = clock.query().unwrap();
        assert_eq!(state, TransportState::Rolling);
        assert!(frame >= 10_000);
        assert!(frame < 20_000);
    }

    #[test]
    fn state_string_round_trip() {
        for state in [
            TransportState::Stopped,
            TransportState::Rolling,
            TransportState::Starting,
        ] {
            assert_eq!(TransportState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TransportState::parse("paused"), None);
    }
}
