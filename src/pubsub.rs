//! Publish/subscribe: channel and pattern subscriptions, plus the message
//! fan-out used by keyspace notifications.

use std::collections::HashMap;

use bytes::Bytes;

use crate::resp::Reply;
use crate::server::Server;
use crate::types::{ErrorKind, ServerError, ServerResult};
use crate::util::stringmatch;

#[derive(Debug, Default)]
pub struct PubSub {
    pub channels: HashMap<Bytes, Vec<u64>>,
    /// (pattern, client); scanned linearly on publish.
    pub patterns: Vec<(Bytes, u64)>,
}

impl PubSub {
    pub fn subscribe(&mut self, channel: Bytes, cid: u64) -> bool {
        let subs = self.channels.entry(channel).or_default();
        if subs.contains(&cid) {
            return false;
        }
        subs.push(cid);
        true
    }

    pub fn unsubscribe(&mut self, channel: &[u8], cid: u64) -> bool {
        if let Some(subs) = self.channels.get_mut(channel) {
            if let Some(pos) = subs.iter().position(|&c| c == cid) {
                subs.remove(pos);
                if subs.is_empty() {
                    self.channels.remove(channel);
                }
                return true;
            }
        }
        false
    }

    pub fn psubscribe(&mut self, pattern: Bytes, cid: u64) -> bool {
        if self.patterns.iter().any(|(p, c)| *c == cid && p == &pattern) {
            return false;
        }
        self.patterns.push((pattern, cid));
        true
    }

    pub fn punsubscribe(&mut self, pattern: &[u8], cid: u64) -> bool {
        match self.patterns.iter().position(|(p, c)| *c == cid && &p[..] == pattern) {
            Some(pos) => {
                self.patterns.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn drop_client(&mut self, cid: u64) {
        self.channels.retain(|_, subs| {
            subs.retain(|&c| c != cid);
            !subs.is_empty()
        });
        self.patterns.retain(|(_, c)| *c != cid);
    }

    /// Receivers for a message: direct subscribers, then pattern matches.
    pub fn receivers(&self, channel: &[u8]) -> Vec<(u64, Option<Bytes>)> {
        let mut out = Vec::new();
        if let Some(subs) = self.channels.get(channel) {
            for &cid in subs {
                out.push((cid, None));
            }
        }
        for (pattern, cid) in &self.patterns {
            if stringmatch(pattern, channel) {
                out.push((*cid, Some(pattern.clone())));
            }
        }
        out
    }
}

impl Server {
    /// Deliver `message` to everyone subscribed to `channel`; returns the
    /// receiver count.
    pub fn publish_message(&mut self, channel: &[u8], message: Bytes) -> usize {
        let receivers = self.pubsub.receivers(channel);
        let count = receivers.len();
        for (cid, pattern) in receivers {
            let frame = match pattern {
                None => Reply::Push(vec![
                    Reply::bulk(&b"message"[..]),
                    Reply::bulk(channel.to_vec()),
                    Reply::Bulk(message.clone()),
                ]),
                Some(pat) => Reply::Push(vec![
                    Reply::bulk(&b"pmessage"[..]),
                    Reply::Bulk(pat),
                    Reply::bulk(channel.to_vec()),
                    Reply::Bulk(message.clone()),
                ]),
            };
            self.push_reply_to(cid, &frame);
        }
        count
    }
}

pub fn subscribe_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    for channel in &argv[1..] {
        srv.pubsub.subscribe(channel.clone(), cid);
        srv.client_mut(cid).sub_channels.insert(channel.clone());
        let count = srv.client(cid).sub_channels.len() + srv.client(cid).sub_patterns.len();
        let frame = Reply::Push(vec![
            Reply::bulk(&b"subscribe"[..]),
            Reply::Bulk(channel.clone()),
            Reply::Int(count as i64),
        ]);
        srv.push_reply_to(cid, &frame);
    }
    Ok(Reply::None)
}

pub fn unsubscribe_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let channels: Vec<Bytes> = if argv.len() > 1 {
        argv[1..].to_vec()
    } else {
        srv.client(cid).sub_channels.iter().cloned().collect()
    };
    if channels.is_empty() {
        let frame = Reply::Push(vec![
            Reply::bulk(&b"unsubscribe"[..]),
            Reply::Nil,
            Reply::Int(0),
        ]);
        srv.push_reply_to(cid, &frame);
        return Ok(Reply::None);
    }
    for channel in channels {
        srv.pubsub.unsubscribe(&channel, cid);
        srv.client_mut(cid).sub_channels.remove(&channel);
        let count = srv.client(cid).sub_channels.len() + srv.client(cid).sub_patterns.len();
        let frame = Reply::Push(vec![
            Reply::bulk(&b"unsubscribe"[..]),
            Reply::Bulk(channel),
            Reply::Int(count as i64),
        ]);
        srv.push_reply_to(cid, &frame);
    }
    Ok(Reply::None)
}

pub fn psubscribe_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    for pattern in &argv[1..] {
        srv.pubsub.psubscribe(pattern.clone(), cid);
        srv.client_mut(cid).sub_patterns.insert(pattern.clone());
        let count = srv.client(cid).sub_channels.len() + srv.client(cid).sub_patterns.len();
        let frame = Reply::Push(vec![
            Reply::bulk(&b"psubscribe"[..]),
            Reply::Bulk(pattern.clone()),
            Reply::Int(count as i64),
        ]);
        srv.push_reply_to(cid, &frame);
    }
    Ok(Reply::None)
}

pub fn punsubscribe_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let patterns: Vec<Bytes> = if argv.len() > 1 {
        argv[1..].to_vec()
    } else {
        srv.client(cid).sub_patterns.iter().cloned().collect()
    };
    if patterns.is_empty() {
        let frame = Reply::Push(vec![
            Reply::bulk(&b"punsubscribe"[..]),
            Reply::Nil,
            Reply::Int(0),
        ]);
        srv.push_reply_to(cid, &frame);
        return Ok(Reply::None);
    }
    for pattern in patterns {
        srv.pubsub.punsubscribe(&pattern, cid);
        srv.client_mut(cid).sub_patterns.remove(&pattern);
        let count = srv.client(cid).sub_channels.len() + srv.client(cid).sub_patterns.len();
        let frame = Reply::Push(vec![
            Reply::bulk(&b"punsubscribe"[..]),
            Reply::Bulk(pattern),
            Reply::Int(count as i64),
        ]);
        srv.push_reply_to(cid, &frame);
    }
    Ok(Reply::None)
}

pub fn publish_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    if argv.len() != 3 {
        return Err(ServerError::new(
            ErrorKind::Generic,
            "wrong number of arguments for 'publish' command",
        ));
    }
    let count = srv.publish_message(&argv[1], argv[2].clone());
    Ok(Reply::Int(count as i64))
}
