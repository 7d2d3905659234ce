//! The one process-wide clock, advanced by rendezvous: every registered
//! thread must call [`GlobalClock::tick`] once per round before the clock
//! advances to the next. Mirrors `scm.c`'s `global_time`/
//! `number_of_threads`/`ticked_threads_countdown` trio, all guarded by a
//! single lock (`global_time_lock`), plus `scm_block_thread`/
//! `scm_resume_thread` for threads that step out of the rendezvous for an
//! extended period (e.g. blocking I/O) without fully unregistering.

use once_cell::sync::Lazy;
use parking_lot::Mutex;

struct State {
    time: u64,
    number_of_threads: u32,
    ticked_countdown: u32,
}

/// Outcome of one thread's call to [`GlobalClock::tick`].
pub struct TickOutcome {
    /// The round this call just completed; callers should adopt this as
    /// their new `global_phase`.
    pub ticked_for: u64,
    /// Whether this call was the last one needed this round, advancing
    /// the clock for everyone.
    pub advanced: bool,
}

pub struct GlobalClock {
    state: Mutex<State>,
}

impl GlobalClock {
    pub fn new() -> GlobalClock {
        GlobalClock {
            state: Mutex::new(State {
                time: 1,
                number_of_threads: 0,
                ticked_countdown: 0,
            }),
        }
    }

    pub fn current_time(&self) -> u64 {
        self.state.lock().time
    }

    /// A new thread joins the rendezvous. Returns the current global time,
    /// to seed the thread's own `global_phase`.
    pub fn register_thread(&self) -> u64 {
        let mut s = self.state.lock();
        s.number_of_threads += 1;
        s.ticked_countdown += 1;
        log::debug!("thread registered with global clock ({} active)", s.number_of_threads);
        s.time
    }

    /// A thread is leaving for good. If it hadn't ticked this round yet,
    /// it no longer counts toward completing the round.
    pub fn unregister_thread(&self) {
        let mut s = self.state.lock();
        s.number_of_threads = s.number_of_threads.saturating_sub(1);
        Self::drop_from_round_if_pending(&mut s);
        log::debug!("thread left global clock ({} remain)", s.number_of_threads);
    }

    /// A thread is stepping out of the rendezvous temporarily (e.g. about
    /// to block on I/O), without leaving for good.
    pub fn block_thread(&self) {
        let mut s = self.state.lock();
        s.number_of_threads = s.number_of_threads.saturating_sub(1);
        Self::drop_from_round_if_pending(&mut s);
    }

    /// Rejoins the rendezvous after `block_thread`.
    pub fn resume_thread(&self) {
        let mut s = self.state.lock();
        s.number_of_threads += 1;
        s.ticked_countdown += 1;
    }

    /// Removing a thread that hadn't ticked yet this round means one fewer
    /// tick is needed to close it out; check whether that was the last one.
    fn drop_from_round_if_pending(s: &mut State) {
        if s.ticked_countdown > s.number_of_threads {
            s.ticked_countdown = s.ticked_countdown.saturating_sub(1);
            if s.ticked_countdown == 0 {
                s.time += 1;
                s.ticked_countdown = s.number_of_threads;
                log::trace!("global clock advanced to {} (thread removal closed the round)", s.time);
            }
        }
    }

    /// Completes this thread's tick for the current round. The caller is
    /// expected to have already checked its own `global_phase` against
    /// [`GlobalClock::current_time`] and skip calling this if it already
    /// ticked this round.
    pub fn tick(&self) -> TickOutcome {
        let mut s = self.state.lock();
        let ticked_for = s.time;
        s.ticked_countdown = s.ticked_countdown.saturating_sub(1);
        let advanced = if s.ticked_countdown == 0 {
            s.time += 1;
            s.ticked_countdown = s.number_of_threads;
            log::trace!("global clock advanced to {}", s.time);
            true
        } else {
            false
        };
        TickOutcome { ticked_for, advanced }
    }
}

impl Default for GlobalClock {
    fn default() -> Self {
        Self::new()
    }
}

/// The one process-wide clock instance every thread rendezvouses on.
pub static GLOBAL: Lazy<GlobalClock> = Lazy::new(GlobalClock::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_thread_advances_every_tick() {
        let clock = GlobalClock::new();
        let phase = clock.register_thread();
        assert_eq!(phase, 1);

        let out = clock.tick();
        assert_eq!(out.ticked_for, 1);
        assert!(out.advanced);
        assert_eq!(clock.current_time(), 2);
    }

    #[test]
    fn two_threads_must_both_tick_before_advancing() {
        let clock = GlobalClock::new();
        clock.register_thread();
        clock.register_thread();

        let first = clock.tick();
        assert!(!first.advanced);
        assert_eq!(clock.current_time(), 1);

        let second = clock.tick();
        assert!(second.advanced);
        assert_eq!(clock.current_time(), 2);
    }

    #[test]
    fn unregistering_a_pending_thread_can_close_the_round() {
        let clock = GlobalClock::new();
        clock.register_thread();
        clock.register_thread();

        clock.tick();
        assert_eq!(clock.current_time(), 1);
        clock.unregister_thread();
        assert_eq!(clock.current_time(), 2);
    }

    #[test]
    fn block_and_resume_round_trip() {
        let clock = GlobalClock::new();
        clock.register_thread();
        clock.register_thread();

        clock.block_thread();
        let out = clock.tick();
        assert!(out.advanced);

        clock.resume_thread();
        let out2 = clock.tick();
        assert!(!out2.advanced);
    }
}
