//! Ordered application of a replication stream through parallel swaps.
//!
//! A master link would serialize horribly if every replicated command
//! blocked on its own swap I/O. Instead the master client only parses and
//! dispatches: commands move round-robin onto a pool of detached worker
//! clients which start their swaps in parallel, while a FIFO of in-use
//! workers guarantees the commands *execute* in exactly the dispatch
//! order. MULTI/EXEC stays queued on the master client and moves to one
//! worker atomically at EXEC.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::command;
use crate::connection::SwapCb;
use crate::server::Server;

#[derive(Debug, Default)]
pub struct ReplState {
    pub workers_free: VecDeque<u64>,
    /// Dispatch-ordered FIFO; only the head may execute.
    pub workers_used: VecDeque<u64>,
    /// Master clients parked waiting for a free worker.
    pub swapping_clients: VecDeque<u64>,
}

/// What `repl_dispatch` did with the parsed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplDispatch {
    /// Handed to a worker (or queued into MULTI); keep reading the stream.
    Dispatched,
    /// No free worker; the master client must pause its input.
    Blocked,
}

impl Server {
    /// Entry point for a command parsed off a master link.
    pub fn repl_dispatch(&mut self, cid: u64) -> ReplDispatch {
        let argv = self.client(cid).argv.clone();
        let name = argv[0].to_ascii_lowercase();

        if name == b"multi" {
            self.client_mut(cid).multi = Some(Vec::new());
            return ReplDispatch::Dispatched;
        }
        if self.client(cid).multi.is_some() && name != b"exec" {
            self.client_mut(cid)
                .multi
                .as_mut()
                .expect("multi checked")
                .push(argv);
            return ReplDispatch::Dispatched;
        }

        let Some(&wid) = self.repl.workers_free.front() else {
            // Command stays parsed on the client; the worker-finished
            // callback re-dispatches us.
            self.repl.swapping_clients.push_back(cid);
            self.client_mut(cid).swapping = true;
            return ReplDispatch::Blocked;
        };
        self.repl.workers_free.pop_front();

        // Move the command (or the whole transaction) to the worker.
        let batch: Vec<Vec<Bytes>> = if name == b"exec" {
            self.client_mut(cid).multi.take().unwrap_or_default()
        } else {
            vec![argv]
        };
        let db = self.client(cid).db;
        {
            let wc = self.client_mut(wid);
            wc.db = db;
            wc.repl_client = Some(cid);
            wc.repl_cmd_discarded = false;
            wc.swap_cb = SwapCb::ReplWorker;
            wc.argv = batch.first().cloned().unwrap_or_default();
            wc.multi = if batch.len() > 1 { Some(batch.clone()) } else { None };
        }
        self.client_mut(cid).swapping_count += 1;

        // Start every swap the batch needs; execution is deferred to the
        // ordered drain below.
        let mut intents = Vec::new();
        for cmd in &batch {
            let saved = std::mem::replace(&mut self.client_mut(wid).argv, cmd.clone());
            intents.extend(command::get_swaps(self, wid));
            self.client_mut(wid).argv = saved;
        }
        let nswaps = self.client_swap_swaps(wid, intents);
        self.client_mut(wid).repl_swapping = nswaps > 0;
        self.repl.workers_used.push_back(wid);

        self.process_finished_repl_commands();
        ReplDispatch::Dispatched
    }

    /// Retire workers from the head of the in-use FIFO whose swaps are
    /// done, executing their commands in dispatch order.
    pub fn process_finished_repl_commands(&mut self) {
        loop {
            let Some(&wid) = self.repl.workers_used.front() else { break };
            if self.client(wid).repl_swapping {
                break;
            }
            self.repl.workers_used.pop_front();

            let master = self.client(wid).repl_client;
            let discarded = self.client(wid).repl_cmd_discarded;
            if !discarded {
                let batch: Vec<Vec<Bytes>> = match self.client(wid).multi.clone() {
                    Some(cmds) => cmds,
                    None => vec![self.client(wid).argv.clone()],
                };
                for cmd in batch {
                    self.client_mut(wid).argv = cmd;
                    command::call_replicated(self, wid);
                }
            }
            {
                let wc = self.client_mut(wid);
                wc.multi = None;
                wc.repl_client = None;
                wc.repl_cmd_discarded = false;
            }
            self.client_unhold_keys(wid);
            self.repl.workers_free.push_back(wid);

            if let Some(mid) = master {
                if self.client_exists(mid) {
                    let c = self.client_mut(mid);
                    c.swapping_count = c.swapping_count.saturating_sub(1);
                    let gone = c.defered_closing && c.swapping_count == 0;
                    if gone {
                        self.free_client_final(mid);
                    }
                }
            }
        }
    }

    /// A worker freed up: unpark master clients that were waiting and let
    /// them re-dispatch the command still sitting in their argv, then
    /// continue with any bytes already read from the stream.
    pub fn retry_blocked_repl_clients(&mut self) {
        if self.repl.swapping_clients.is_empty() || self.repl.workers_free.is_empty() {
            return;
        }
        let parked: Vec<u64> = self.repl.swapping_clients.drain(..).collect();
        for cid in parked {
            if !self.client_exists(cid) {
                continue;
            }
            self.client_mut(cid).swapping = false;
            match self.repl_dispatch(cid) {
                ReplDispatch::Blocked => {}
                ReplDispatch::Dispatched => {
                    self.process_input_buffer(cid);
                }
            }
        }
    }

    /// The master link dropped: dispatched-but-unexecuted commands are
    /// discarded as if never received.
    pub fn repl_client_gone(&mut self, cid: u64) {
        let mut discarded = 0;
        for &wid in self.repl.workers_used.iter() {
            if self.client(wid).repl_client == Some(cid) {
                discarded += 1;
            }
        }
        let used: Vec<u64> = self.repl.workers_used.iter().copied().collect();
        for wid in used {
            if self.client(wid).repl_client == Some(cid) {
                self.client_mut(wid).repl_cmd_discarded = true;
            }
        }
        if discarded > 0 {
            tracing::info!(master = cid, discarded, "discarding dispatched replicated commands");
        }
        if let Some(pos) = self.repl.swapping_clients.iter().position(|&c| c == cid) {
            self.repl.swapping_clients.remove(pos);
        }
    }
}
