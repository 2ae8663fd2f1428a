//! End-to-end greylister test: a stream of framed pipe records is applied
//! in order, then a scan promotes, expires and emits the firewall payloads.

use std::fmt::Write as _;

use greyd_common::config::Config;
use greyd_common::pipe::FrameParser;
use greyd_db::key::{DB_DOMAINS, DB_ENTRIES, DB_SPAMTRAPS};
use greyd_db::{Handle, Key, MemoryDriver, Tuple, Val};
use greyd_fw::{Af, FwMessage};
use greyd_grey::{Broadcast, Greylister, scan_once};

const NOW: i64 = 1_000_000;

fn write_grey(out: &mut String, dst_ip: &str, ip: &str, helo: &str, from: &str, to: &str) {
    let _ = write!(
        out,
        "type = 1\ndst_ip = \"{dst_ip}\"\nip = \"{ip}\"\nhelo = \"{helo}\"\nfrom = \"{from}\"\nto = \"{to}\"\n%\n"
    );
}

fn write_non_grey(out: &mut String, code: i64, source: &str, ip: &str, expires: i64) {
    let _ = write!(
        out,
        "type = {code}\nip = \"{ip}\"\nsource = \"{source}\"\nexpires = \"{expires}\"\n%\n"
    );
}

fn write_white(out: &mut String, source: &str, ip: &str, expires: i64) {
    write_non_grey(out, 2, source, ip, expires);
}

fn write_trap(out: &mut String, source: &str, ip: &str, expires: i64) {
    write_non_grey(out, 3, source, ip, expires);
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Tally {
    entries: usize,
    white: usize,
    grey: usize,
    trapped: usize,
    spamtrap: usize,
    domains: usize,
    white_passed: i32,
    white_blocked: i32,
    grey_passed: i32,
    grey_blocked: i32,
}

fn tally(db: &mut Handle) -> Tally {
    let mut tally = Tally::default();
    let mut cursor = db
        .cursor(DB_ENTRIES | DB_SPAMTRAPS | DB_DOMAINS)
        .unwrap();
    while let Some((key, val)) = cursor.next_entry() {
        tally.entries += 1;
        match key {
            Key::Ip(_) => {
                if val.pcount == -1 {
                    tally.trapped += 1;
                } else {
                    tally.white += 1;
                    tally.white_passed += val.pcount;
                    tally.white_blocked += val.bcount;
                }
            }
            Key::Mail(_) => tally.spamtrap += 1,
            Key::Dom(_) => tally.domains += 1,
            Key::Tuple(_) => {
                tally.grey += 1;
                tally.grey_passed += val.pcount;
                tally.grey_blocked += val.bcount;
            }
            Key::DomPart(_) => unreachable!("lookup-only keys are never stored"),
        }
    }
    tally
}

fn apply_stream(greylister: &Greylister, db: &mut Handle, stream: &str) {
    let mut parser = FrameParser::new();
    for line in stream.lines() {
        if let Some(event) = parser.feed_line(line).unwrap() {
            greylister.apply(db, &event, NOW).unwrap();
        }
    }
}

fn sorted(mut ips: Vec<String>) -> Vec<String> {
    ips.sort();
    ips
}

#[test]
fn reader_stream_then_scan() {
    let config = Config::parse(
        r#"
        low_prio_mx = "192.179.21.3"

        [grey]
        db_permitted_domains = true
        traplist_name = "test traplist"
        traplist_message = "you have been trapped"
        grey_expiry = 3600
        "#,
    )
    .unwrap();

    // Startup far enough in the past for the backup MX rule to be armed.
    let greylister = Greylister::with_domains(
        &config,
        NOW - 120,
        vec!["domain4.com".to_string(), "domain2.com".to_string()],
    );
    assert_eq!(greylister.domains().len(), 2);

    let mut db = Handle::from_driver(Box::new(MemoryDriver::new())).unwrap();

    // Seed a spamtrap address and two database-permitted domains.
    db.put(
        &Key::Mail("trap@domain3.com".to_string()),
        &Val::spamtrap(NOW),
    )
    .unwrap();
    db.put(
        &Key::Dom("greyd@domain3.com".to_string()),
        &Val::domain(NOW),
    )
    .unwrap();
    db.put(&Key::Dom("domain1.com".to_string()), &Val::domain(NOW))
        .unwrap();

    let mut stream = String::new();

    // Grey entries, then the same entries again.
    for _ in 0..2 {
        write_grey(
            &mut stream,
            "2.3.4.5",
            "1.2.3.4",
            "jackiemclean.net",
            "m@jackiemclean.net",
            "r@domain1.com",
        );
        write_grey(
            &mut stream,
            "2.3.1.5",
            "1.2.4.4",
            "jackiemclean.net",
            "m@jackiemclean.net",
            "r@domain1.com",
        );
        write_grey(
            &mut stream,
            "2.3.2.5",
            "1.2.2.4",
            "jackiemclean.net",
            "m@jackiemclean.net",
            "r@domain1.com",
        );
    }

    // White entries, duplicated as well.
    for _ in 0..2 {
        write_white(&mut stream, "2.3.4.5", "4.3.2.1", NOW + 3600);
        write_white(&mut stream, "2.3.4.6", "4.3.2.2", NOW + 3600);
        write_white(&mut stream, "2.3.4.7", "4.3.2.3", NOW + 3600);
    }

    // Trap entries, duplicated.
    for _ in 0..2 {
        write_trap(&mut stream, "3.2.4.5", "3.4.2.1", NOW + 3600);
        write_trap(&mut stream, "3.2.4.6", "3.4.2.2", NOW + 3600);
        write_trap(&mut stream, "3.2.4.7", "3.4.3.2", NOW + 3600);
    }

    // An expired white and an expired trap entry.
    write_white(&mut stream, "8.8.8.3", "7.7.6.5", NOW - 3600);
    write_trap(&mut stream, "8.8.8.5", "7.7.6.6", NOW - 120);

    // Mail to an explicit spamtrap address inside a permitted domain.
    write_grey(
        &mut stream,
        "2.3.2.5",
        "1.2.2.4",
        "jackiemclean.net",
        "m@jackiemclean.net",
        "trap@domain3.com",
    );

    // Mail to a domain permitted nowhere.
    write_grey(
        &mut stream,
        "2.3.2.5",
        "1.2.2.4",
        "jackiemclean.net",
        "m@jackiemclean.net",
        "trap@willbetrapped.com",
    );

    // A whitelist entry sharing its address with an existing grey tuple.
    write_white(&mut stream, "2.3.4.7", "1.2.3.4", NOW + 3600);

    // A delivery via the backup MX passes on first sight.
    write_grey(
        &mut stream,
        "192.179.21.3",
        "1.2.2.34",
        "jackiemclean.net",
        "m@jackiemclean.net",
        "notrap@domain4.com",
    );

    apply_stream(&greylister, &mut db, &stream);

    let after_reader = tally(&mut db);
    assert_eq!(after_reader, Tally {
        entries: 17,
        white: 6,
        grey: 3,
        trapped: 5,
        spamtrap: 1,
        domains: 2,
        white_passed: 3,
        white_blocked: 1,
        grey_passed: 0,
        grey_blocked: 6,
    });

    // A whitelist record and a tuple for the same address co-exist.
    assert!(
        db.get(&Key::Ip("1.2.3.4".to_string())).unwrap().is_some()
            && db
                .get(&Key::Tuple(Tuple {
                    ip: "1.2.3.4".to_string(),
                    helo: "jackiemclean.net".to_string(),
                    from: "m@jackiemclean.net".to_string(),
                    to: "r@domain1.com".to_string(),
                }))
                .unwrap()
                .is_some()
    );

    // Age one tuple to expiry and bring another past its pass time.
    let expired_key = Key::Tuple(Tuple {
        ip: "1.2.2.4".to_string(),
        helo: "jackiemclean.net".to_string(),
        from: "m@jackiemclean.net".to_string(),
        to: "r@domain1.com".to_string(),
    });
    let val = db.get(&expired_key).unwrap().unwrap();
    db.put(&expired_key, &Val {
        expire: NOW - 120,
        ..val
    })
    .unwrap();

    let due_key = Key::Tuple(Tuple {
        ip: "1.2.4.4".to_string(),
        helo: "jackiemclean.net".to_string(),
        from: "m@jackiemclean.net".to_string(),
        to: "r@domain1.com".to_string(),
    });
    let val = db.get(&due_key).unwrap().unwrap();
    db.put(&due_key, &Val {
        pass: NOW - 60,
        ..val
    })
    .unwrap();

    let emit = scan_once(&greylister, &mut db, NOW).unwrap();
    assert_eq!(emit.messages.len(), 3);

    match &emit.messages[0] {
        FwMessage::Replace { name, af, ips } => {
            assert_eq!(name, "greyd-whitelist");
            assert_eq!(*af, Af::Inet);
            assert_eq!(
                sorted(ips.clone()),
                sorted(vec![
                    "1.2.2.34".to_string(),
                    "1.2.3.4".to_string(),
                    "1.2.4.4".to_string(),
                    "4.3.2.1".to_string(),
                    "4.3.2.2".to_string(),
                    "4.3.2.3".to_string(),
                ])
            );
        }
        other => panic!("expected IPv4 whitelist, got {other:?}"),
    }

    match &emit.messages[1] {
        FwMessage::Replace { af, ips, .. } => {
            assert_eq!(*af, Af::Inet6);
            assert!(ips.is_empty());
        }
        other => panic!("expected IPv6 whitelist, got {other:?}"),
    }

    match &emit.messages[2] {
        FwMessage::Traplist { name, message, ips } => {
            assert_eq!(name, "test traplist");
            assert_eq!(message, "you have been trapped");
            assert_eq!(
                sorted(ips.clone()),
                sorted(vec![
                    "1.2.2.4".to_string(),
                    "3.4.2.1".to_string(),
                    "3.4.2.2".to_string(),
                    "3.4.3.2".to_string(),
                ])
            );
        }
        other => panic!("expected traplist, got {other:?}"),
    }

    assert_eq!(emit.broadcasts, vec![Broadcast::White {
        ip: "1.2.4.4".to_string(),
        expire: NOW + greylister.config().white_exp,
        delete: false,
    }]);

    // Promotion is atomic: tuple gone, address record present.
    assert!(db.get(&due_key).unwrap().is_none());
    let promoted = db.get(&Key::Ip("1.2.4.4".to_string())).unwrap().unwrap();
    assert_eq!(promoted.expire, NOW + greylister.config().white_exp);

    let after_scan = tally(&mut db);
    assert_eq!(after_scan, Tally {
        entries: 14,
        white: 6,
        grey: 1,
        trapped: 4,
        spamtrap: 1,
        domains: 2,
        white_passed: 3,
        white_blocked: 3,
        grey_passed: 0,
        grey_blocked: 2,
    });
}
