//! ACL engine coverage: rules, bitmap round-trips, password checks, the
//! audit log, file persistence and dispatch-time denials.

mod support;

use support::*;

use riptide::acl::{self, Acl, AclDenied, User};

fn rules(acl: &mut Acl, user: &mut User, tokens: &[&str]) {
    for token in tokens {
        acl.apply_rule(user, token.as_bytes()).expect(token);
    }
}

#[test]
fn default_user_is_permissive() {
    let acl = Acl::new();
    let user = acl.find_user("default").expect("default always exists");
    assert!(user.enabled);
    assert!(user.nopass);
    assert!(user.allkeys);
    assert!(user.allcommands);
}

#[test]
fn describe_set_round_trip_reproduces_bitmap() {
    let mut acl = Acl::new();
    let mut user = User::new("alice");
    rules(&mut acl, &mut user, &["on", "-@all", "+get", "+set", "+acl|whoami", "~cache:*"]);

    let described = acl.describe_commands(&user);
    let mut fresh = User::new("fresh");
    for token in described.split_whitespace() {
        acl.apply_rule(&mut fresh, token.as_bytes()).expect(token);
    }
    assert_eq!(fresh.bitmap(), user.bitmap());
    assert_eq!(fresh.allowed_subcommands, user.allowed_subcommands);
}

#[test]
fn plus_at_all_sets_future_commands_and_minus_revokes() {
    let mut acl = Acl::new();
    let mut user = User::new("u");
    rules(&mut acl, &mut user, &["+@all"]);
    assert!(user.allcommands);
    rules(&mut acl, &mut user, &["-get"]);
    // Any revocation drops the future-commands grant.
    assert!(!user.allcommands);
    let get_id = acl.lookup_command_id("get").unwrap();
    let set_id = acl.lookup_command_id("set").unwrap();
    assert!(!user.get_bit(get_id));
    assert!(user.get_bit(set_id));
}

#[test]
fn categories_resolve_to_commands() {
    let mut acl = Acl::new();
    let mut user = User::new("u");
    rules(&mut acl, &mut user, &["-@all", "+@read"]);
    assert!(user.get_bit(acl.lookup_command_id("get").unwrap()));
    assert!(!user.get_bit(acl.lookup_command_id("set").unwrap()));
    rules(&mut acl, &mut user, &["-@read"]);
    assert!(!user.get_bit(acl.lookup_command_id("get").unwrap()));
}

#[test]
fn subcommand_rules_are_additive_only() {
    let mut acl = Acl::new();
    let mut user = User::new("u");
    rules(&mut acl, &mut user, &["-@all", "+client|getname"]);
    let id = acl.lookup_command_id("client").unwrap();
    assert!(!user.get_bit(id));
    assert!(user.can_run(id, &argv(&["client", "GETNAME"])));
    assert!(!user.can_run(id, &argv(&["client", "SETNAME"])));

    // A fully-granted parent refuses subcommand additions.
    rules(&mut acl, &mut user, &["+client"]);
    assert_eq!(
        acl.apply_rule(&mut user, b"+client|id"),
        Err(acl::AclError::BusyParentCommand)
    );
    // And -cmd|sub is never valid.
    assert_eq!(acl.apply_rule(&mut user, b"-client|id"), Err(acl::AclError::Syntax));
}

#[test]
fn pattern_after_allkeys_is_rejected() {
    let mut acl = Acl::new();
    let mut user = User::new("u");
    rules(&mut acl, &mut user, &["~*"]);
    assert_eq!(
        acl.apply_rule(&mut user, b"~cache:*"),
        Err(acl::AclError::PatternAfterAllkeys)
    );
    rules(&mut acl, &mut user, &["resetkeys", "~cache:*"]);
    assert!(user.key_allowed(b"cache:42"));
    assert!(!user.key_allowed(b"user:42"));
}

#[test]
fn password_rules_and_constant_time_check() {
    let mut acl = Acl::new();
    let mut user = User::new("u");
    rules(&mut acl, &mut user, &[">hunter2"]);
    assert!(!user.nopass);
    assert!(Acl::check_password(&user, b"hunter2"));
    assert!(!Acl::check_password(&user, b"hunter3"));

    // Pre-hashed add/remove round trip.
    let hash = riptide::util::sha256_hex(b"other");
    rules(&mut acl, &mut user, &[format!("#{}", hash).as_str()]);
    assert!(Acl::check_password(&user, b"other"));
    rules(&mut acl, &mut user, &[format!("!{}", hash).as_str()]);
    assert!(!Acl::check_password(&user, b"other"));

    assert_eq!(acl.apply_rule(&mut user, b"#nothex"), Err(acl::AclError::BadHash));
    assert_eq!(
        acl.apply_rule(&mut user, b"<never-set"),
        Err(acl::AclError::MissingPassword)
    );

    rules(&mut acl, &mut user, &["nopass"]);
    assert!(user.passwords.is_empty());
    assert!(Acl::check_password(&user, b"anything"));
}

#[test]
fn reset_rule_wipes_the_user() {
    let mut acl = Acl::new();
    let mut user = User::new("u");
    rules(&mut acl, &mut user, &["on", "+@all", "~*", ">pw", "reset"]);
    assert!(!user.enabled);
    assert!(!user.allkeys);
    assert!(user.passwords.is_empty());
    assert!(!user.allcommands);
}

#[test]
fn unknown_names_error() {
    let mut acl = Acl::new();
    let mut user = User::new("u");
    assert_eq!(
        acl.apply_rule(&mut user, b"+frobnicate"),
        Err(acl::AclError::UnknownCommandOrCategory)
    );
    assert_eq!(
        acl.apply_rule(&mut user, b"+@nocategory"),
        Err(acl::AclError::UnknownCommandOrCategory)
    );
    assert_eq!(acl.apply_rule(&mut user, b"bogus"), Err(acl::AclError::Syntax));
}

#[test]
fn audit_log_dedups_within_window() {
    let mut ts = server();
    ts.server
        .acl
        .set_user("alice", &argv(&["on", "nopass", "-@all", "+get", "~cache:*"]))
        .unwrap();
    let c = ts.mock();
    assert_ok(&ts.run(c, &["AUTH", "alice", "x"]));

    for _ in 0..3 {
        assert_error_tag(&ts.run(c, &["GET", "user:42"]), "NOPERM");
    }
    assert_eq!(ts.server.acl.log.len(), 1, "grouped within the time window");
    let entry = &ts.server.acl.log[0];
    assert_eq!(entry.count, 3);
    assert_eq!(entry.reason, AclDenied::Key);
    assert_eq!(&entry.object[..], b"user:42");
    assert_eq!(entry.username, "alice");

    // A denial of a different kind inserts a fresh entry.
    assert_error_tag(&ts.run(c, &["SET", "cache:1", "v"]), "NOPERM");
    assert_eq!(ts.server.acl.log.len(), 2);
    assert_eq!(ts.server.acl.log[0].reason, AclDenied::Cmd);
}

#[test]
fn deny_by_pattern_allows_matching_keys() {
    let mut ts = server();
    ts.server
        .acl
        .set_user("alice", &argv(&["on", "nopass", "-@all", "+get", "+set", "~cache:*"]))
        .unwrap();
    let c = ts.mock();
    assert_ok(&ts.run(c, &["AUTH", "alice", ""]));
    assert_ok(&ts.run(c, &["SET", "cache:42", "v"]));
    assert_bulk(&ts.run(c, &["GET", "cache:42"]), "v");
    assert_error_tag(&ts.run(c, &["GET", "user:42"]), "NOPERM");
}

#[test]
fn disabled_users_cannot_authenticate() {
    let mut ts = server();
    ts.server.acl.set_user("bob", &argv(&["off", ">pw"])).unwrap();
    let c = ts.mock();
    assert_error_tag(&ts.run(c, &["AUTH", "bob", "pw"]), "WRONGPASS");
    assert_eq!(ts.server.acl.log[0].reason, AclDenied::Auth);
}

#[test]
fn acl_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("users.acl").to_string_lossy().into_owned();

    let mut acl = Acl::new();
    acl.set_user(
        "alice",
        &argv(&["on", "-@all", "+get", "+acl|whoami", "~cache:*", ">secret"]),
    )
    .unwrap();
    acl.set_user("bob", &argv(&["off", "nopass", "allkeys", "+@read"])).unwrap();
    let before: Vec<String> = acl
        .users
        .iter()
        .map(|u| format!("user {} {}", u.name, acl.describe_user(u)))
        .collect();

    acl::save_acl_file(&acl, &path).unwrap();
    let mut reloaded = Acl::new();
    acl::load_acl_file(&mut reloaded, &path).unwrap();
    let after: Vec<String> = reloaded
        .users
        .iter()
        .map(|u| format!("user {} {}", u.name, reloaded.describe_user(u)))
        .collect();
    assert_eq!(before, after);
}

#[test]
fn bad_acl_file_leaves_memory_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("users.acl");
    std::fs::write(&path, "user ok on nopass ~* +@all\nuser broken on +nosuchcmd\n").unwrap();

    let mut acl = Acl::new();
    acl.set_user("keepme", &argv(&["on"])).unwrap();
    let err = acl::load_acl_file(&mut acl, &path.to_string_lossy());
    assert!(err.is_err());
    assert!(acl.find_user("keepme").is_some());
    assert!(acl.find_user("ok").is_none());
}

#[test]
fn genpass_length_tracks_bits() {
    assert_eq!(acl::genpass(256).len(), 64);
    assert_eq!(acl::genpass(1).len(), 1);
    assert_eq!(acl::genpass(20).len(), 5);
    assert_ne!(acl::genpass(256), acl::genpass(256));
}

#[test]
fn acl_command_surface() {
    let mut ts = server();
    let c = ts.mock();
    assert_bulk(&ts.run(c, &["ACL", "WHOAMI"]), "default");
    let users = ts.run(c, &["ACL", "USERS"]);
    assert!(String::from_utf8_lossy(&users).contains("default"));
    assert_ok(&ts.run(c, &["ACL", "SETUSER", "carol", "on", "nopass", "-@all", "+ping"]));
    let list = ts.run(c, &["ACL", "LIST"]);
    assert!(String::from_utf8_lossy(&list).contains("user carol on"));
    assert_int(&ts.run(c, &["ACL", "DELUSER", "carol"]), 1);
    assert_error_tag(&ts.run(c, &["ACL", "DELUSER", "default"]), "ERR");
    let cats = ts.run(c, &["ACL", "CAT"]);
    assert!(String::from_utf8_lossy(&cats).contains("sortedset"));
}
