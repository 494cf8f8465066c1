//! The single-threaded event loop: fd readiness plus time events.
//!
//! One `Reactor` owns the OS multiplexer (epoll, kqueue, ... — whatever the
//! poll backend selects for the platform at build time) and a list of time
//! events. Everything the server does happens inside `run`: wait for
//! readiness no longer than the nearest timer, dispatch ready tokens, fire
//! due timers, repeat. Readiness dispatch reports read and write in a
//! single pass, and a hangup or error surfaces as both so handlers observe
//! the close by reading zero bytes.
//!
//! `C` is the context threaded through every callback (the server state);
//! the reactor itself holds no application data.

use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token};

use crate::util::mstime;

/// Default readiness event capacity per poll round.
const EVENTS_CAPACITY: usize = 1024;

/// What a time-event callback wants done with its event.
pub enum TimerAction {
    /// Re-arm the event this many milliseconds from now.
    Again(u64),
    /// Delete the event (its finalizer runs).
    Remove,
}

type TimerCb<C> = Box<dyn FnMut(&mut C) -> TimerAction>;
type Finalizer<C> = Box<dyn FnMut(&mut C)>;
type Hook<C> = Box<dyn FnMut(&Registry, &mut C)>;

struct TimeEvent<C> {
    id: u64,
    due_ms: i64,
    cb: TimerCb<C>,
    finalizer: Option<Finalizer<C>>,
}

/// Readiness of one token in one poll round.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}

pub struct Reactor<C> {
    poll: Poll,
    timers: Vec<TimeEvent<C>>,
    next_timer_id: u64,
    last_poll_ms: i64,
    stop: bool,
    before_sleep: Option<Hook<C>>,
    after_sleep: Option<Hook<C>>,
}

impl<C> Reactor<C> {
    /// Failing to create the multiplexer is not survivable; the caller
    /// treats `Err` as fatal.
    pub fn new() -> io::Result<Self> {
        Ok(Reactor {
            poll: Poll::new()?,
            timers: Vec::new(),
            next_timer_id: 1,
            last_poll_ms: mstime(),
            stop: false,
            before_sleep: None,
            after_sleep: None,
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    pub fn reregister<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    pub fn add_timer(
        &mut self,
        after_ms: u64,
        cb: TimerCb<C>,
        finalizer: Option<Finalizer<C>>,
    ) -> u64 {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.push(TimeEvent { id, due_ms: mstime() + after_ms as i64, cb, finalizer });
        id
    }

    /// Cancel a timer; its finalizer runs immediately. Returns false for an
    /// unknown id.
    pub fn cancel_timer(&mut self, id: u64, ctx: &mut C) -> bool {
        if let Some(pos) = self.timers.iter().position(|t| t.id == id) {
            let mut t = self.timers.swap_remove(pos);
            if let Some(fin) = t.finalizer.as_mut() {
                fin(ctx);
            }
            true
        } else {
            false
        }
    }

    pub fn set_before_sleep(&mut self, hook: Hook<C>) {
        self.before_sleep = Some(hook);
    }

    pub fn set_after_sleep(&mut self, hook: Hook<C>) {
        self.after_sleep = Some(hook);
    }

    pub fn stop(&mut self) {
        self.stop = true;
    }

    fn nearest_timeout(&self) -> Option<Duration> {
        let due = self.timers.iter().map(|t| t.due_ms).min()?;
        let wait = (due - mstime()).max(0);
        Some(Duration::from_millis(wait as u64))
    }

    /// Run until stopped. `on_ready` is invoked once per ready token per
    /// round, reads before writes unless the handler's barrier flag says
    /// otherwise (that ordering choice belongs to the handler since both
    /// directions are reported together).
    pub fn run<F>(&mut self, ctx: &mut C, mut on_ready: F) -> io::Result<()>
    where
        F: FnMut(&mut Reactor<C>, &mut C, Token, Readiness),
    {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        while !self.stop {
            self.poll_once(ctx, &mut events, &mut on_ready)?;
        }
        Ok(())
    }

    /// One pass of the loop: hooks, wait, readiness dispatch, timers.
    pub fn poll_once<F>(
        &mut self,
        ctx: &mut C,
        events: &mut Events,
        on_ready: &mut F,
    ) -> io::Result<()>
    where
        F: FnMut(&mut Reactor<C>, &mut C, Token, Readiness),
    {
        let timeout = self.nearest_timeout();

        if let Some(mut hook) = self.before_sleep.take() {
            hook(self.poll.registry(), ctx);
            self.before_sleep = Some(hook);
        }

        match self.poll.poll(events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        if let Some(mut hook) = self.after_sleep.take() {
            hook(self.poll.registry(), ctx);
            self.after_sleep = Some(hook);
        }

        let ready: Vec<(Token, Readiness)> = events
            .iter()
            .map(|ev| {
                let hangup = ev.is_read_closed() || ev.is_write_closed() || ev.is_error();
                (
                    ev.token(),
                    Readiness {
                        // Hangups count as both directions so the handler
                        // reads the zero-byte close.
                        readable: ev.is_readable() || hangup,
                        writable: ev.is_writable() || hangup,
                        hangup,
                    },
                )
            })
            .collect();
        for (token, readiness) in ready {
            on_ready(self, ctx, token, readiness);
        }

        self.process_time_events(ctx);
        Ok(())
    }

    fn process_time_events(&mut self, ctx: &mut C) {
        let now = mstime();
        if now < self.last_poll_ms {
            // The wall clock moved backward: force every timer due so
            // scheduled work is not delayed indefinitely.
            for t in &mut self.timers {
                t.due_ms = 0;
            }
        }
        self.last_poll_ms = now;

        // Events registered by callbacks during this pass run next pass.
        let max_id = self.next_timer_id;
        let mut idx = 0;
        while idx < self.timers.len() {
            if self.timers[idx].id >= max_id || self.timers[idx].due_ms > now {
                idx += 1;
                continue;
            }
            let mut event = self.timers.swap_remove(idx);
            match (event.cb)(ctx) {
                TimerAction::Again(ms) => {
                    event.due_ms = mstime() + ms as i64;
                    self.timers.push(event);
                    // The re-armed event moved to the tail; do not advance
                    // so the slot that swapped in gets examined.
                }
                TimerAction::Remove => {
                    if let Some(fin) = event.finalizer.as_mut() {
                        fin(ctx);
                    }
                }
            }
        }
    }

    #[cfg(test)]
    fn force_timers_due(&mut self) {
        for t in &mut self.timers {
            t.due_ms = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn timer_fires_and_reschedules() {
        let mut reactor: Reactor<u32> = Reactor::new().unwrap();
        let mut ctx = 0u32;
        reactor.add_timer(
            0,
            Box::new(|c| {
                *c += 1;
                if *c < 3 {
                    TimerAction::Again(0)
                } else {
                    TimerAction::Remove
                }
            }),
            None,
        );
        let mut events = Events::with_capacity(8);
        for _ in 0..5 {
            if reactor.timers.is_empty() {
                break;
            }
            reactor.poll_once(&mut ctx, &mut events, &mut |_, _, _, _| {}).unwrap();
        }
        assert_eq!(ctx, 3);
        assert!(reactor.timers.is_empty());
    }

    #[test]
    fn cancel_runs_finalizer() {
        let mut reactor: Reactor<u32> = Reactor::new().unwrap();
        let mut ctx = 0u32;
        let id = reactor.add_timer(
            10_000,
            Box::new(|_| TimerAction::Remove),
            Some(Box::new(|c| *c = 99)),
        );
        assert!(reactor.cancel_timer(id, &mut ctx));
        assert!(!reactor.cancel_timer(id, &mut ctx));
        assert_eq!(ctx, 99);
    }

    #[test]
    fn skew_forces_timers_due() {
        let mut reactor: Reactor<u32> = Reactor::new().unwrap();
        let mut ctx = 0u32;
        reactor.add_timer(60_000, Box::new(|c| {
            *c += 1;
            TimerAction::Remove
        }), None);
        // Simulate a backward wall-clock jump: the pass detects the skew,
        // forces all due times to zero and fires the event immediately.
        reactor.last_poll_ms = mstime() + 10_000;
        reactor.process_time_events(&mut ctx);
        assert_eq!(ctx, 1);
    }

    #[test]
    fn hooks_wrap_the_wait() {
        let mut reactor: Reactor<Vec<&'static str>> = Reactor::new().unwrap();
        let mut ctx: Vec<&'static str> = Vec::new();
        reactor.set_before_sleep(Box::new(|_, c| c.push("before")));
        reactor.set_after_sleep(Box::new(|_, c| c.push("after")));
        reactor.add_timer(0, Box::new(|_| TimerAction::Remove), None);
        reactor.force_timers_due();
        let mut events = Events::with_capacity(8);
        reactor.poll_once(&mut ctx, &mut events, &mut |_, _, _, _| {}).unwrap();
        assert_eq!(ctx, vec!["before", "after"]);
    }

    #[test]
    fn waker_readiness_reaches_the_callback() {
        let mut reactor: Reactor<()> = Reactor::new().unwrap();
        let waker = mio::Waker::new(reactor.registry(), Token(7)).unwrap();
        waker.wake().unwrap();
        reactor.add_timer(10, Box::new(|_| TimerAction::Remove), None);
        let fired = Rc::new(Cell::new(false));
        let fired2 = fired.clone();
        let mut events = Events::with_capacity(8);
        let mut ctx = ();
        reactor
            .poll_once(&mut ctx, &mut events, &mut |_, _, token, ready| {
                if token == Token(7) && ready.readable {
                    fired2.set(true);
                }
            })
            .unwrap();
        assert!(fired.get());
    }
}
