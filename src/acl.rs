//! The ACL engine: users, command bitmaps, key patterns, the audit log and
//! the `ACL` command family.

use std::collections::HashMap;
use std::collections::VecDeque;

use bytes::Bytes;
use rand::RngCore;
use thiserror::Error;

use crate::command::{self, CommandSpec};
use crate::resp::Reply;
use crate::server::Server;
use crate::types::{ErrorKind, ServerError, ServerResult};
use crate::util::{mstime, sha256_hex, stringmatch, time_independent_eq};

/// Fixed command-bitmap width. The top bit is reserved: set only by
/// `+@all`, it means commands defined in the future are allowed too.
pub const USER_COMMAND_BITS: usize = 1024;
const BITMAP_WORDS: usize = USER_COMMAND_BITS / 64;
const RESERVED_FUTURE_BIT: usize = USER_COMMAND_BITS - 1;

/// Audit log capacity.
const ACL_LOG_MAX: usize = 128;
/// Entries within this window that share (reason, context, object, user)
/// bump a counter instead of inserting.
const ACL_LOG_GROUPING_MAX_TIME_DELTA: i64 = 60_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AclError {
    #[error("Unknown command or category name in ACL")]
    UnknownCommandOrCategory,
    #[error("Syntax error in ACL rule")]
    Syntax,
    #[error("Adding a subcommand of a command already fully added is not allowed. Remove the command to start add the subcommand")]
    BusyParentCommand,
    #[error("Adding a pattern after the * pattern (or the 'allkeys' flag) is not valid and does not have any effect. Try 'resetkeys' to start with an empty list of patterns")]
    PatternAfterAllkeys,
    #[error("A password hash must be exactly 64 characters and contain only lowercase hexadecimal characters")]
    BadHash,
    #[error("The password you are trying to remove is not set")]
    MissingPassword,
}

impl From<AclError> for ServerError {
    fn from(e: AclError) -> ServerError {
        ServerError::new(ErrorKind::Generic, format!("Error in ACL SETUSER modifier: {}", e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclDenied {
    Cmd,
    Key,
    Auth,
}

impl AclDenied {
    pub fn as_str(self) -> &'static str {
        match self {
            AclDenied::Cmd => "command",
            AclDenied::Key => "key",
            AclDenied::Auth => "auth",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclContext {
    Toplevel,
    Multi,
}

impl AclContext {
    pub fn as_str(self) -> &'static str {
        match self {
            AclContext::Toplevel => "toplevel",
            AclContext::Multi => "multi",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AclLogEntry {
    pub count: u64,
    pub reason: AclDenied,
    pub context: AclContext,
    pub object: Bytes,
    pub username: String,
    pub ctime_ms: i64,
    pub client_info: String,
}

#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub enabled: bool,
    pub nopass: bool,
    /// Lowercase SHA-256 hex digests.
    pub passwords: Vec<String>,
    pub allkeys: bool,
    pub allcommands: bool,
    bitmap: [u64; BITMAP_WORDS],
    /// command id -> lowercase subcommand tokens, only meaningful while the
    /// parent command's bit is 0.
    pub allowed_subcommands: HashMap<usize, Vec<Vec<u8>>>,
    pub patterns: Vec<Bytes>,
}

impl User {
    pub fn new(name: &str) -> Self {
        User {
            name: name.to_string(),
            enabled: false,
            nopass: false,
            passwords: Vec::new(),
            allkeys: false,
            allcommands: false,
            bitmap: [0; BITMAP_WORDS],
            allowed_subcommands: HashMap::new(),
            patterns: Vec::new(),
        }
    }

    pub fn get_bit(&self, id: usize) -> bool {
        id < USER_COMMAND_BITS && self.bitmap[id / 64] & (1 << (id % 64)) != 0
    }

    fn set_bit(&mut self, id: usize, value: bool) {
        if id >= USER_COMMAND_BITS {
            return;
        }
        if value {
            self.bitmap[id / 64] |= 1 << (id % 64);
        } else {
            self.bitmap[id / 64] &= !(1 << (id % 64));
        }
    }

    pub fn bitmap(&self) -> &[u64; BITMAP_WORDS] {
        &self.bitmap
    }

    fn grant_all_commands(&mut self) {
        self.bitmap = [u64::MAX; BITMAP_WORDS];
        self.allcommands = true;
        self.allowed_subcommands.clear();
    }

    fn revoke_all_commands(&mut self) {
        self.bitmap = [0; BITMAP_WORDS];
        self.allcommands = false;
        self.allowed_subcommands.clear();
    }

    /// May this user run `cmd` with the given argv (for subcommand grants)?
    pub fn can_run(&self, id: usize, argv: &[Bytes]) -> bool {
        if self.get_bit(id) || self.get_bit(RESERVED_FUTURE_BIT) {
            return true;
        }
        if argv.len() >= 2 {
            if let Some(subs) = self.allowed_subcommands.get(&id) {
                let sub = argv[1].to_ascii_lowercase();
                return subs.iter().any(|s| s == &sub);
            }
        }
        false
    }

    pub fn key_allowed(&self, key: &[u8]) -> bool {
        self.allkeys || self.patterns.iter().any(|p| stringmatch(p, key))
    }
}

#[derive(Debug)]
pub struct Acl {
    pub users: Vec<User>,
    command_ids: HashMap<String, usize>,
    names_by_id: Vec<String>,
    pub log: VecDeque<AclLogEntry>,
}

impl Acl {
    /// Builds the engine and the built-in `default` user (enabled, nopass,
    /// all keys, all commands), assigning ids to every known command in
    /// first-seen order.
    pub fn new() -> Self {
        let mut acl = Acl {
            users: Vec::new(),
            command_ids: HashMap::new(),
            names_by_id: Vec::new(),
            log: VecDeque::new(),
        };
        for spec in command::all_commands() {
            acl.command_id(spec.name);
        }
        let mut default = User::new("default");
        default.enabled = true;
        default.nopass = true;
        default.allkeys = true;
        default.grant_all_commands();
        acl.users.push(default);
        acl
    }

    /// Ids are allocated by first-seen name and never recycled.
    pub fn command_id(&mut self, name: &str) -> usize {
        if let Some(&id) = self.command_ids.get(name) {
            return id;
        }
        let id = self.names_by_id.len();
        self.command_ids.insert(name.to_string(), id);
        self.names_by_id.push(name.to_string());
        id
    }

    pub fn lookup_command_id(&self, name: &str) -> Option<usize> {
        self.command_ids.get(name).copied()
    }

    pub fn find_user(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.name == name)
    }

    pub fn find_user_mut(&mut self, name: &str) -> Option<&mut User> {
        self.users.iter_mut().find(|u| u.name == name)
    }

    pub fn delete_user(&mut self, name: &str) -> bool {
        match self.users.iter().position(|u| u.name == name) {
            Some(pos) if name != "default" => {
                self.users.remove(pos);
                true
            }
            _ => false,
        }
    }

    fn commands_in_category(&self, flag: u32) -> Vec<usize> {
        command::all_commands()
            .filter(|spec| spec.categories & flag != 0)
            .filter_map(|spec| self.command_ids.get(spec.name).copied())
            .collect()
    }

    /// Apply one rule token to a user under construction.
    pub fn apply_rule(&mut self, user: &mut User, rule: &[u8]) -> Result<(), AclError> {
        let lower = rule.to_ascii_lowercase();
        match lower.as_slice() {
            b"on" => user.enabled = true,
            b"off" => user.enabled = false,
            b"allkeys" | b"~*" => {
                user.allkeys = true;
                user.patterns.clear();
            }
            b"resetkeys" => {
                user.allkeys = false;
                user.patterns.clear();
            }
            b"allcommands" | b"+@all" => user.grant_all_commands(),
            b"nocommands" | b"-@all" => user.revoke_all_commands(),
            b"nopass" => {
                user.nopass = true;
                user.passwords.clear();
            }
            b"resetpass" => {
                user.nopass = false;
                user.passwords.clear();
            }
            b"reset" => {
                *user = User::new(&user.name);
            }
            _ => return self.apply_prefixed_rule(user, rule, &lower),
        }
        Ok(())
    }

    fn apply_prefixed_rule(
        &mut self,
        user: &mut User,
        rule: &[u8],
        lower: &[u8],
    ) -> Result<(), AclError> {
        match rule.first() {
            Some(b'~') => {
                if user.allkeys {
                    return Err(AclError::PatternAfterAllkeys);
                }
                let pattern = Bytes::copy_from_slice(&rule[1..]);
                if !user.patterns.contains(&pattern) {
                    user.patterns.push(pattern);
                }
                Ok(())
            }
            Some(b'>') => {
                let hash = sha256_hex(&rule[1..]);
                if !user.passwords.contains(&hash) {
                    user.passwords.push(hash);
                }
                user.nopass = false;
                Ok(())
            }
            Some(b'<') => {
                let hash = sha256_hex(&rule[1..]);
                match user.passwords.iter().position(|h| *h == hash) {
                    Some(pos) => {
                        user.passwords.remove(pos);
                        Ok(())
                    }
                    None => Err(AclError::MissingPassword),
                }
            }
            Some(b'#') => {
                let hash = parse_password_hash(&rule[1..])?;
                if !user.passwords.contains(&hash) {
                    user.passwords.push(hash);
                }
                user.nopass = false;
                Ok(())
            }
            Some(b'!') => {
                let hash = parse_password_hash(&rule[1..])?;
                match user.passwords.iter().position(|h| *h == hash) {
                    Some(pos) => {
                        user.passwords.remove(pos);
                        Ok(())
                    }
                    None => Err(AclError::MissingPassword),
                }
            }
            Some(b'+') | Some(b'-') => {
                let grant = rule[0] == b'+';
                let body = &lower[1..];
                if body.first() == Some(&b'@') {
                    let name = std::str::from_utf8(&body[1..]).map_err(|_| AclError::Syntax)?;
                    let flag = command::category_flag(name)
                        .ok_or(AclError::UnknownCommandOrCategory)?;
                    for id in self.commands_in_category(flag) {
                        user.set_bit(id, grant);
                        if grant {
                            user.allowed_subcommands.remove(&id);
                        }
                    }
                    if !grant {
                        // Any revocation invalidates the future-commands
                        // grant.
                        user.set_bit(RESERVED_FUTURE_BIT, false);
                        user.allcommands = false;
                    }
                    Ok(())
                } else if let Some(pipe) = body.iter().position(|&b| b == b'|') {
                    if !grant {
                        // Subcommand rules are only additive.
                        return Err(AclError::Syntax);
                    }
                    let (cmd_name, sub) = (&body[..pipe], &body[pipe + 1..]);
                    if sub.is_empty() {
                        return Err(AclError::Syntax);
                    }
                    let name = std::str::from_utf8(cmd_name).map_err(|_| AclError::Syntax)?;
                    if command::lookup_command(cmd_name).is_none() {
                        return Err(AclError::UnknownCommandOrCategory);
                    }
                    let id = self.command_id(name);
                    if user.get_bit(id) {
                        return Err(AclError::BusyParentCommand);
                    }
                    let entry = user.allowed_subcommands.entry(id).or_default();
                    if !entry.iter().any(|s| s == sub) {
                        entry.push(sub.to_vec());
                    }
                    Ok(())
                } else {
                    let name = std::str::from_utf8(body).map_err(|_| AclError::Syntax)?;
                    if command::lookup_command(body).is_none() {
                        return Err(AclError::UnknownCommandOrCategory);
                    }
                    let id = self.command_id(name);
                    user.set_bit(id, grant);
                    if grant {
                        user.allowed_subcommands.remove(&id);
                    } else {
                        user.allowed_subcommands.remove(&id);
                        user.set_bit(RESERVED_FUTURE_BIT, false);
                        user.allcommands = false;
                    }
                    Ok(())
                }
            }
            _ => Err(AclError::Syntax),
        }
    }

    /// Apply `rules` to `username`, creating the user if needed. The rules
    /// run against a copy first so an error leaves the live set untouched.
    pub fn set_user(&mut self, username: &str, rules: &[Bytes]) -> Result<(), AclError> {
        let mut user = self
            .find_user(username)
            .cloned()
            .unwrap_or_else(|| User::new(username));
        for rule in rules {
            self.apply_rule(&mut user, rule)?;
        }
        match self.find_user_mut(username) {
            Some(slot) => *slot = user,
            None => self.users.push(user),
        }
        Ok(())
    }

    /// The straightforward serialization of a user's command rules:
    /// `+@all` / `-@all` base followed by per-command exceptions and
    /// subcommand grants. Feeding the result back through `set_user`
    /// reproduces the bitmap exactly.
    pub fn describe_commands(&self, user: &User) -> String {
        let mut out = String::new();
        if user.get_bit(RESERVED_FUTURE_BIT) {
            out.push_str("+@all");
            for (id, name) in self.names_by_id.iter().enumerate() {
                if !user.get_bit(id) {
                    out.push_str(" -");
                    out.push_str(name);
                }
            }
        } else {
            out.push_str("-@all");
            for (id, name) in self.names_by_id.iter().enumerate() {
                if user.get_bit(id) {
                    out.push_str(" +");
                    out.push_str(name);
                }
            }
        }
        let mut subs: Vec<(&usize, &Vec<Vec<u8>>)> = user.allowed_subcommands.iter().collect();
        subs.sort_by_key(|(id, _)| **id);
        for (id, tokens) in subs {
            for sub in tokens {
                out.push_str(" +");
                out.push_str(&self.names_by_id[*id]);
                out.push('|');
                out.push_str(&String::from_utf8_lossy(sub));
            }
        }
        out
    }

    /// Full rule line for `ACL LIST` and the ACL file (without the leading
    /// `user <name>`).
    pub fn describe_user(&self, user: &User) -> String {
        let mut parts: Vec<String> = Vec::new();
        parts.push(if user.enabled { "on".into() } else { "off".into() });
        if user.nopass {
            parts.push("nopass".into());
        }
        for hash in &user.passwords {
            parts.push(format!("#{}", hash));
        }
        if user.allkeys {
            parts.push("~*".into());
        } else {
            for p in &user.patterns {
                parts.push(format!("~{}", String::from_utf8_lossy(p)));
            }
        }
        parts.push(self.describe_commands(user));
        parts.join(" ")
    }

    /// Constant-time password check against every stored hash.
    pub fn check_password(user: &User, password: &[u8]) -> bool {
        if user.nopass {
            return true;
        }
        let hashed = sha256_hex(password);
        let mut ok = false;
        for stored in &user.passwords {
            // No early exit: every candidate is compared in full.
            if time_independent_eq(stored.as_bytes(), hashed.as_bytes()) {
                ok = true;
            }
        }
        ok
    }

    pub fn add_log_entry(
        &mut self,
        reason: AclDenied,
        context: AclContext,
        object: Bytes,
        username: String,
        client_info: String,
    ) {
        let now = mstime();
        for entry in self.log.iter_mut() {
            if entry.reason == reason
                && entry.context == context
                && entry.object == object
                && entry.username == username
                && now - entry.ctime_ms < ACL_LOG_GROUPING_MAX_TIME_DELTA
            {
                entry.count += 1;
                entry.ctime_ms = now;
                return;
            }
        }
        self.log.push_front(AclLogEntry {
            count: 1,
            reason,
            context,
            object,
            username,
            ctime_ms: now,
            client_info,
        });
        while self.log.len() > ACL_LOG_MAX {
            self.log.pop_back();
        }
    }
}

impl Default for Acl {
    fn default() -> Self {
        Acl::new()
    }
}

fn parse_password_hash(hex: &[u8]) -> Result<String, AclError> {
    if hex.len() != 64
        || !hex.iter().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
    {
        return Err(AclError::BadHash);
    }
    Ok(String::from_utf8_lossy(hex).into_owned())
}

/// Random password for `ACL GENPASS`: `bits` of entropy as hex.
pub fn genpass(bits: u32) -> String {
    let nchars = (bits as usize + 3) / 4;
    let mut bytes = vec![0u8; (nchars + 1) / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(nchars);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out.truncate(nchars);
    out
}

// -------------------------------------------------------------- ACL file

/// Parse and validate a whole ACL file into users, without touching the
/// live set. Rules are applied to throwaway users; the first error aborts.
pub fn parse_acl_file(acl: &mut Acl, contents: &str) -> Result<Vec<User>, String> {
    let mut users: Vec<User> = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("user") {
            return Err(format!("line {}: every line must start with 'user'", lineno + 1));
        }
        let Some(name) = tokens.next() else {
            return Err(format!("line {}: missing username", lineno + 1));
        };
        if users.iter().any(|u| u.name == name) {
            return Err(format!("line {}: duplicate user '{}'", lineno + 1, name));
        }
        let mut user = User::new(name);
        for rule in tokens {
            acl.apply_rule(&mut user, rule.as_bytes())
                .map_err(|e| format!("line {}: {}", lineno + 1, e))?;
        }
        users.push(user);
    }
    if !users.iter().any(|u| u.name == "default") {
        let mut default = User::new("default");
        default.enabled = true;
        default.nopass = true;
        default.allkeys = true;
        default.grant_all_commands();
        users.insert(0, default);
    }
    Ok(users)
}

pub fn render_acl_file(acl: &Acl) -> String {
    let mut out = String::new();
    for user in &acl.users {
        out.push_str("user ");
        out.push_str(&user.name);
        out.push(' ');
        out.push_str(&acl.describe_user(user));
        out.push('\n');
    }
    out
}

/// Atomic rewrite: write `<file>.tmp-<pid>-<ms>`, then rename over.
pub fn save_acl_file(acl: &Acl, path: &str) -> std::io::Result<()> {
    let tmp = format!("{}.tmp-{}-{}", path, std::process::id(), mstime());
    std::fs::write(&tmp, render_acl_file(acl))?;
    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

pub fn load_acl_file(acl: &mut Acl, path: &str) -> Result<(), String> {
    let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let users = parse_acl_file(acl, &contents)?;
    acl.users = users;
    Ok(())
}

// -------------------------------------------------------------- commands

impl Server {
    /// The dispatch-time permission check. `Err` carries the denial reason
    /// and, for key denials, the offending argv index.
    pub fn acl_check(
        &self,
        cid: u64,
        spec: &'static CommandSpec,
        argv: &[Bytes],
    ) -> Result<(), (AclDenied, usize)> {
        let username = self.client(cid).user.clone();
        let Some(user) = self.acl.find_user(&username) else {
            return Err((AclDenied::Cmd, 0));
        };
        let Some(id) = self.acl.lookup_command_id(spec.name) else {
            return Err((AclDenied::Cmd, 0));
        };
        if !user.can_run(id, argv) {
            return Err((AclDenied::Cmd, 0));
        }
        if !user.allkeys {
            for pos in command::command_key_positions(spec, argv) {
                if !user.key_allowed(&argv[pos]) {
                    return Err((AclDenied::Key, pos));
                }
            }
        }
        Ok(())
    }

    pub fn add_acl_log_entry(&mut self, cid: u64, reason: AclDenied, keypos: usize) {
        let c = self.client(cid);
        let object = match reason {
            AclDenied::Cmd => c.argv.first().cloned().unwrap_or_default(),
            AclDenied::Key => c.argv.get(keypos).cloned().unwrap_or_default(),
            AclDenied::Auth => c.argv.first().cloned().unwrap_or_default(),
        };
        let context = if c.multi.is_some() { AclContext::Multi } else { AclContext::Toplevel };
        let username = c.user.clone();
        let client_info = format!("id={} addr={} name={}", c.id, c.peer_id(),
            c.name.as_deref().map(String::from_utf8_lossy).unwrap_or_default());
        self.acl.add_log_entry(reason, context, object, username, client_info);
    }

    /// AUTH / HELLO AUTH path. On success binds the client to the user.
    pub fn authenticate_client(
        &mut self,
        cid: u64,
        username: &[u8],
        password: &[u8],
    ) -> ServerResult<()> {
        let name = String::from_utf8_lossy(username).into_owned();
        let ok = match self.acl.find_user(&name) {
            Some(user) if user.enabled => Acl::check_password(user, password),
            _ => false,
        };
        if !ok {
            self.add_acl_log_entry(cid, AclDenied::Auth, 0);
            return Err(ServerError::new(
                ErrorKind::WrongPass,
                "invalid username-password pair or user is disabled.",
            ));
        }
        let c = self.client_mut(cid);
        c.user = name;
        c.authenticated = true;
        Ok(())
    }
}

pub fn acl_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let sub = argv[1].to_ascii_uppercase();
    match sub.as_slice() {
        b"WHOAMI" if argv.len() == 2 => {
            Ok(Reply::bulk(srv.client(cid).user.clone().into_bytes()))
        }
        b"USERS" if argv.len() == 2 => Ok(Reply::Array(
            srv.acl.users.iter().map(|u| Reply::bulk(u.name.clone().into_bytes())).collect(),
        )),
        b"LIST" if argv.len() == 2 => Ok(Reply::Array(
            srv.acl
                .users
                .iter()
                .map(|u| Reply::bulk(format!("user {} {}", u.name, srv.acl.describe_user(u)).into_bytes()))
                .collect(),
        )),
        b"CAT" => match argv.len() {
            2 => Ok(Reply::Array(
                command::CATEGORIES
                    .iter()
                    .map(|(name, _)| Reply::bulk(name.as_bytes().to_vec()))
                    .collect(),
            )),
            3 => {
                let name = String::from_utf8_lossy(&argv[2]).to_lowercase();
                let flag = command::category_flag(&name).ok_or_else(|| {
                    ServerError::new(ErrorKind::Generic, format!("Unknown ACL cat '{}'", name))
                })?;
                Ok(Reply::Array(
                    command::all_commands()
                        .filter(|spec| spec.categories & flag != 0)
                        .map(|spec| Reply::bulk(spec.name.as_bytes().to_vec()))
                        .collect(),
                ))
            }
            _ => Err(ServerError::syntax()),
        },
        b"SETUSER" if argv.len() >= 3 => {
            let username = String::from_utf8_lossy(&argv[2]).into_owned();
            srv.acl.set_user(&username, &argv[3..]).map_err(ServerError::from)?;
            Ok(Reply::Ok)
        }
        b"DELUSER" if argv.len() >= 3 => {
            let mut deleted = 0i64;
            for name in &argv[2..] {
                let name = String::from_utf8_lossy(name).into_owned();
                if name == "default" {
                    return Err(ServerError::new(
                        ErrorKind::Generic,
                        "The 'default' user cannot be removed",
                    ));
                }
                if srv.acl.delete_user(&name) {
                    deleted += 1;
                }
            }
            Ok(Reply::Int(deleted))
        }
        b"GETUSER" if argv.len() == 3 => {
            let name = String::from_utf8_lossy(&argv[2]).into_owned();
            let Some(user) = srv.acl.find_user(&name) else {
                return Ok(Reply::Nil);
            };
            let mut flags = vec![Reply::bulk(if user.enabled { &b"on"[..] } else { &b"off"[..] })];
            if user.allkeys {
                flags.push(Reply::bulk(&b"allkeys"[..]));
            }
            if user.allcommands {
                flags.push(Reply::bulk(&b"allcommands"[..]));
            }
            if user.nopass {
                flags.push(Reply::bulk(&b"nopass"[..]));
            }
            Ok(Reply::Map(vec![
                (Reply::bulk(&b"flags"[..]), Reply::Array(flags)),
                (
                    Reply::bulk(&b"passwords"[..]),
                    Reply::Array(
                        user.passwords
                            .iter()
                            .map(|h| Reply::bulk(h.clone().into_bytes()))
                            .collect(),
                    ),
                ),
                (
                    Reply::bulk(&b"commands"[..]),
                    Reply::bulk(srv.acl.describe_commands(user).into_bytes()),
                ),
                (
                    Reply::bulk(&b"keys"[..]),
                    if user.allkeys {
                        Reply::Array(vec![Reply::bulk(&b"*"[..])])
                    } else {
                        Reply::Array(user.patterns.iter().cloned().map(Reply::Bulk).collect())
                    },
                ),
            ]))
        }
        b"GENPASS" => {
            let bits = if argv.len() == 3 {
                let b = crate::util::parse_i64(&argv[2])?;
                if !(1..=4096).contains(&b) {
                    return Err(ServerError::new(
                        ErrorKind::Generic,
                        "ACL GENPASS argument must be the number of bits for the output password, a positive number up to 4096",
                    ));
                }
                b as u32
            } else {
                256
            };
            Ok(Reply::bulk(genpass(bits).into_bytes()))
        }
        b"LOG" => {
            if argv.len() == 3 && argv[2].eq_ignore_ascii_case(b"reset") {
                srv.acl.log.clear();
                return Ok(Reply::Ok);
            }
            let mut count = srv.acl.log.len() as i64;
            if argv.len() == 3 {
                count = crate::util::parse_i64(&argv[2])?;
            } else if argv.len() != 2 {
                return Err(ServerError::syntax());
            }
            let now = mstime();
            let out = srv
                .acl
                .log
                .iter()
                .take(count.max(0) as usize)
                .map(|e| {
                    Reply::Map(vec![
                        (Reply::bulk(&b"count"[..]), Reply::Int(e.count as i64)),
                        (Reply::bulk(&b"reason"[..]), Reply::bulk(e.reason.as_str().as_bytes().to_vec())),
                        (Reply::bulk(&b"context"[..]), Reply::bulk(e.context.as_str().as_bytes().to_vec())),
                        (Reply::bulk(&b"object"[..]), Reply::Bulk(e.object.clone())),
                        (Reply::bulk(&b"username"[..]), Reply::bulk(e.username.clone().into_bytes())),
                        (
                            Reply::bulk(&b"age-seconds"[..]),
                            Reply::Double((now - e.ctime_ms) as f64 / 1000.0),
                        ),
                        (
                            Reply::bulk(&b"client-info"[..]),
                            Reply::bulk(e.client_info.clone().into_bytes()),
                        ),
                    ])
                })
                .collect();
            Ok(Reply::Array(out))
        }
        b"SAVE" if argv.len() == 2 => {
            let Some(path) = srv.config.acl_filename.clone() else {
                return Err(ServerError::new(
                    ErrorKind::Generic,
                    "This instance is not configured to use an ACL file. You may want to specify users via the ACL SETUSER command and then issue a CONFIG REWRITE (assuming you have a config file) in order to store users in the server configuration.",
                ));
            };
            save_acl_file(&srv.acl, &path)
                .map_err(|e| ServerError::new(ErrorKind::Io, format!("ACL SAVE failed: {}", e)))?;
            Ok(Reply::Ok)
        }
        b"LOAD" if argv.len() == 2 => {
            let Some(path) = srv.config.acl_filename.clone() else {
                return Err(ServerError::new(
                    ErrorKind::Generic,
                    "This instance is not configured to use an ACL file.",
                ));
            };
            load_acl_file(&mut srv.acl, &path)
                .map_err(|e| ServerError::new(ErrorKind::Generic, format!("ACL LOAD failed: {}", e)))?;
            Ok(Reply::Ok)
        }
        b"HELP" if argv.len() == 2 => Ok(Reply::Array(
            [
                "SETUSER <username> [rule ...] -- Create or modify a user.",
                "DELUSER <username> [...] -- Delete users.",
                "GETUSER <username> -- Get the user's details.",
                "LIST -- Show users rules.",
                "USERS -- List the registered usernames.",
                "WHOAMI -- Return the current connection username.",
                "CAT [category] -- List categories, or commands inside one.",
                "LOG [count | RESET] -- Show the ACL log entries.",
                "GENPASS [bits] -- Generate a secure 256-bit user password.",
                "LOAD -- Reload users from the ACL file.",
                "SAVE -- Save the current users to the ACL file.",
            ]
            .iter()
            .map(|s| Reply::simple(*s))
            .collect(),
        )),
        _ => Err(ServerError::new(
            ErrorKind::Generic,
            format!(
                "Unknown ACL subcommand or wrong number of arguments for '{}'",
                String::from_utf8_lossy(&argv[1])
            ),
        )),
    }
}
