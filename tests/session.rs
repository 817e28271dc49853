//! Session tests against a scripted in-process peer speaking the wire
//! protocol.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use spec_client::message::PROTOCOL_VERSION;
use spec_client::{
    connect_to, DispatchMode, Message, Opcode, Slot, SpecCommand, SpecData, SpecError,
    SpecMotor, SpecVariable, Registration,
};

type Responder = Box<dyn FnMut(&Message) -> Vec<Message> + Send>;

struct Peer {
    addr: String,
    seen: mpsc::UnboundedReceiver<Message>,
}

/// A peer that answers HELLO with its identity and otherwise follows the
/// scripted responder. Returning a CLOSE frame from the responder makes
/// the peer hang up instead of answering.
async fn spawn_peer(
    port: Option<u16>,
    identity: &str,
    version: u32,
    mut responder: Responder,
) -> anyhow::Result<Peer> {
    let listener = TcpListener::bind(("127.0.0.1", port.unwrap_or(0))).await?;
    let port = listener.local_addr()?.port();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let identity = identity.to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let mut buf: Vec<u8> = Vec::new();
            let mut chunk = [0u8; 4096];
            'link: loop {
                let n = match sock.read(&mut chunk).await {
                    Ok(0) | Err(_) => break 'link,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);
                while let Ok(Some((msg, used))) = Message::decode(&buf) {
                    buf.drain(..used);
                    let _ = seen_tx.send(msg.clone());
                    let replies = if msg.cmd == Opcode::Hello {
                        vec![Message::hello_reply(msg.sn, &identity, version)]
                    } else {
                        responder(&msg)
                    };
                    for reply in replies {
                        if reply.cmd == Opcode::Close {
                            break 'link;
                        }
                        if sock.write_all(&reply.encode()).await.is_err() {
                            break 'link;
                        }
                    }
                }
            }
        }
    });
    Ok(Peer {
        addr: format!("127.0.0.1:{port}"),
        seen: seen_rx,
    })
}

async fn expect(peer: &mut Peer, pred: impl Fn(&Message) -> bool) -> Message {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = peer.seen.recv().await.expect("peer task went away");
            if pred(&msg) {
                return msg;
            }
        }
    })
    .await
    .expect("expected frame was not observed")
}

fn assoc(entries: &[(&str, SpecData)]) -> SpecData {
    SpecData::Assoc(
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    )
}

fn ignore_all() -> Responder {
    Box::new(|_: &Message| Vec::new())
}

const WAIT: Option<Duration> = Some(Duration::from_secs(10));

#[tokio::test]
async fn scalar_variable_read_with_coalesced_duplicate() -> anyhow::Result<()> {
    let mut peer = spawn_peer(
        None,
        "fourc",
        PROTOCOL_VERSION,
        Box::new(|msg| match msg.cmd {
            Opcode::Register if msg.name == "var/FOO" => vec![Message::event(
                "var/FOO",
                assoc(&[("", SpecData::Int(7))]),
                false,
                None,
            )],
            Opcode::CmdWithReturn if msg.data == SpecData::Str("again".into()) => vec![
                Message::event("var/FOO", assoc(&[("", SpecData::Int(7))]), false, None),
                Message::reply(msg.sn, SpecData::Null, None),
            ],
            _ => Vec::new(),
        }),
    )
    .await?;

    let conn = connect_to(&peer.addr)?;
    conn.wait_connection(WAIT).await?;

    let updates = Arc::new(AtomicUsize::new(0));
    let hits = updates.clone();
    let slot: Arc<Slot> = Arc::new(move |_| {
        hits.fetch_add(1, Ordering::SeqCst);
    });
    let variable = SpecVariable::new("FOO", &conn);
    let channel = variable.watch(&slot, DispatchMode::UpdateValue);

    expect(&mut peer, |m| m.cmd == Opcode::Register && m.name == "var/FOO").await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while channel.value() != Some(SpecData::Int(7)) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    assert_eq!(variable.cached_value().await?, SpecData::Int(7));
    assert_eq!(updates.load(Ordering::SeqCst), 1);

    // The same value again: cached value survives, no second callback.
    conn.send_command_with_reply("again")?.wait(WAIT).await?;
    assert_eq!(variable.cached_value().await?, SpecData::Int(7));
    assert_eq!(updates.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn access_path_extracts_and_coerces() -> anyhow::Result<()> {
    let mut peer = spawn_peer(
        None,
        "fourc",
        PROTOCOL_VERSION,
        Box::new(|msg| match msg.cmd {
            Opcode::Register if msg.name == "var/T" => vec![Message::event(
                "var/T",
                assoc(&[(
                    "x",
                    assoc(&[
                        ("y", SpecData::Str("2.5".into())),
                        ("z", SpecData::Str("nope".into())),
                    ]),
                )]),
                false,
                None,
            )],
            _ => Vec::new(),
        }),
    )
    .await?;

    let conn = connect_to(&peer.addr)?;
    conn.wait_connection(WAIT).await?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let slot: Arc<Slot> = Arc::new(move |args| sink.lock().unwrap().push(args.to_vec()));
    let channel = conn.register_channel("var/T/x/y", &slot, Registration::DoReg, DispatchMode::UpdateValue);

    // The server only ever learns about the parent channel.
    expect(&mut peer, |m| m.cmd == Opcode::Register && m.name == "var/T").await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while channel.value() != Some(SpecData::Double(2.5)) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0],
        vec![SpecData::Double(2.5), SpecData::Str("var/T/x/y".into())]
    );
    Ok(())
}

#[tokio::test]
async fn function_call_round_trip_on_new_peer() -> anyhow::Result<()> {
    let mut peer = spawn_peer(
        None,
        "fourc",
        PROTOCOL_VERSION,
        Box::new(|msg| match msg.cmd {
            Opcode::FuncWithReturn => vec![Message::reply(msg.sn, SpecData::Double(0.0), None)],
            _ => Vec::new(),
        }),
    )
    .await?;

    let conn = connect_to(&peer.addr)?;
    conn.wait_connection(WAIT).await?;

    let command = SpecCommand::new("count", &conn);
    let result = command.run(&[SpecData::Double(1.0)]).await?;
    assert_eq!(result, SpecData::Double(0.0));

    let frame = expect(&mut peer, |m| m.cmd == Opcode::FuncWithReturn).await;
    assert_eq!(
        frame.data,
        SpecData::Array(vec![SpecData::Str("count".into()), SpecData::Double(1.0)])
    );
    Ok(())
}

#[tokio::test]
async fn old_peer_gets_text_commands_and_rejects_functions() -> anyhow::Result<()> {
    let mut peer = spawn_peer(
        None,
        "fourc",
        2,
        Box::new(|msg| match msg.cmd {
            Opcode::CmdWithReturn => vec![Message::reply(msg.sn, SpecData::Int(1), Some(2))],
            _ => Vec::new(),
        }),
    )
    .await?;

    let conn = connect_to(&peer.addr)?;
    conn.wait_connection(WAIT).await?;
    assert_eq!(conn.server_version(), Some(2));

    let command = SpecCommand::new("mymacro", &conn);
    command
        .run(&[SpecData::Str("a".into()), SpecData::Int(2)])
        .await?;
    let frame = expect(&mut peer, |m| m.cmd == Opcode::CmdWithReturn).await;
    assert_eq!(frame.data, SpecData::Str("mymacro 'a' 2".into()));

    match conn.send_function_with_reply("count", &[]) {
        Err(SpecError::Protocol { .. }) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("function calls must be rejected on a v2 peer"),
    }
    Ok(())
}

#[tokio::test]
async fn dropping_a_live_command_handle_aborts() -> anyhow::Result<()> {
    let mut peer = spawn_peer(
        None,
        "fourc",
        PROTOCOL_VERSION,
        // Never answer the function call: the command stays in flight.
        ignore_all(),
    )
    .await?;

    let conn = connect_to(&peer.addr)?;
    conn.wait_connection(WAIT).await?;

    let command = SpecCommand::new("slow_scan", &conn);
    let handle = command.start(&[])?;
    expect(&mut peer, |m| m.cmd == Opcode::FuncWithReturn).await;
    drop(handle);
    expect(&mut peer, |m| m.cmd == Opcode::Abort).await;
    Ok(())
}

#[tokio::test]
async fn completed_command_does_not_abort() -> anyhow::Result<()> {
    let mut peer = spawn_peer(
        None,
        "fourc",
        PROTOCOL_VERSION,
        Box::new(|msg| match msg.cmd {
            Opcode::FuncWithReturn => vec![Message::reply(msg.sn, SpecData::Int(3), None)],
            Opcode::CmdWithReturn => vec![Message::reply(msg.sn, SpecData::Null, None)],
            _ => Vec::new(),
        }),
    )
    .await?;

    let conn = connect_to(&peer.addr)?;
    conn.wait_connection(WAIT).await?;

    let (tx, rx) = std::sync::mpsc::channel();
    let command = SpecCommand::new("wa", &conn);
    let handle = command.start_with(
        &[],
        Some(Box::new(move |data| {
            let _ = tx.send(data.clone());
        })),
        None,
    )?;
    assert_eq!(handle.wait(WAIT).await?, SpecData::Int(3));
    assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, SpecData::Int(3));

    // Round-trip once more; an ABORT would have been seen before it.
    conn.send_command_with_reply("sync")?.wait(WAIT).await?;
    let mut aborted = false;
    while let Ok(m) = peer.seen.try_recv() {
        aborted |= m.cmd == Opcode::Abort;
    }
    assert!(!aborted);
    Ok(())
}

#[tokio::test]
async fn port_scan_finds_the_named_peer() -> anyhow::Result<()> {
    let mut aux = spawn_peer(Some(6510), "aux", PROTOCOL_VERSION, ignore_all()).await?;
    let mut main_peer = spawn_peer(Some(6513), "main", PROTOCOL_VERSION, ignore_all()).await?;

    let conn = connect_to("127.0.0.1:main")?;
    conn.wait_connection(Some(Duration::from_secs(30))).await?;
    assert_eq!(conn.port(), 6513);

    // One greeting each: the decoy answered and was rejected, the match
    // completed the handshake.
    expect(&mut main_peer, |m| m.cmd == Opcode::Hello).await;
    let mut aux_hellos = 0;
    while let Ok(m) = aux.seen.try_recv() {
        if m.cmd == Opcode::Hello {
            aux_hellos += 1;
        }
    }
    assert_eq!(aux_hellos, 1);
    Ok(())
}

#[tokio::test]
async fn server_errors_surface_as_protocol_errors() -> anyhow::Result<()> {
    let peer = spawn_peer(
        None,
        "fourc",
        PROTOCOL_VERSION,
        Box::new(|msg| match msg.cmd {
            Opcode::CmdWithReturn => vec![Message::reply_error(msg.sn, 13, "no such macro", None)],
            _ => Vec::new(),
        }),
    )
    .await?;

    let conn = connect_to(&peer.addr)?;
    conn.wait_connection(WAIT).await?;

    match conn.send_command_with_reply("nonsense")?.wait(WAIT).await {
        Err(SpecError::Protocol { code: 13, message }) => {
            assert_eq!(message, "no such macro");
        }
        other => panic!("expected a protocol error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn unknown_reply_serials_are_dropped() -> anyhow::Result<()> {
    let peer = spawn_peer(
        None,
        "fourc",
        PROTOCOL_VERSION,
        Box::new(|msg| match msg.cmd {
            Opcode::CmdWithReturn => vec![
                Message::reply(9999, SpecData::Int(1), None),
                Message::reply(msg.sn, SpecData::Int(2), None),
            ],
            _ => Vec::new(),
        }),
    )
    .await?;

    let conn = connect_to(&peer.addr)?;
    conn.wait_connection(WAIT).await?;
    let result = conn.send_command_with_reply("noise")?.wait(WAIT).await?;
    assert_eq!(result, SpecData::Int(2));
    Ok(())
}

#[tokio::test]
async fn disconnect_fails_in_flight_replies_and_redials() -> anyhow::Result<()> {
    let mut peer = spawn_peer(
        None,
        "fourc",
        PROTOCOL_VERSION,
        Box::new(|msg| match msg.cmd {
            // The CLOSE sentinel makes the peer hang up.
            Opcode::CmdWithReturn if msg.data == SpecData::Str("hang".into()) => {
                vec![Message::close(None)]
            }
            _ => Vec::new(),
        }),
    )
    .await?;

    let conn = connect_to(&peer.addr)?;
    conn.wait_connection(WAIT).await?;

    let reply = conn.send_command_with_reply("hang")?;
    match reply.wait(WAIT).await {
        Err(SpecError::Disconnected) => {}
        other => panic!("expected Disconnected, got {other:?}"),
    }
    // Forget everything seen on the first link.
    while peer.seen.try_recv().is_ok() {}

    // The dial task keeps going: the same connection object comes back,
    // greets again and re-registers the service channels.
    conn.wait_connection(Some(Duration::from_secs(30))).await?;
    expect(&mut peer, |m| m.cmd == Opcode::Hello).await;
    expect(&mut peer, |m| m.cmd == Opcode::Register && m.name == "error").await;
    Ok(())
}

#[tokio::test]
async fn wait_channel_update_discards_the_registration_replay() -> anyhow::Result<()> {
    let mut peer = spawn_peer(
        None,
        "fourc",
        PROTOCOL_VERSION,
        Box::new(|msg| match msg.cmd {
            Opcode::Register if msg.name == "var/X" => vec![
                // Replay of the current value on subscribe, then a real
                // update.
                Message::event("var/X", assoc(&[("", SpecData::Int(5))]), false, None),
                Message::event("var/X", assoc(&[("", SpecData::Int(6))]), false, None),
            ],
            _ => Vec::new(),
        }),
    )
    .await?;

    let conn = connect_to(&peer.addr)?;
    conn.wait_connection(WAIT).await?;

    let value = spec_client::wait::wait_channel_update(&conn, "var/X", None, WAIT).await?;
    assert_eq!(value, SpecData::Int(6));
    expect(&mut peer, |m| m.cmd == Opcode::Unregister && m.name == "var/X").await;
    Ok(())
}

#[tokio::test]
async fn channel_writes_with_wait_drain_the_buffer() -> anyhow::Result<()> {
    let mut peer = spawn_peer(None, "fourc", PROTOCOL_VERSION, ignore_all()).await?;
    let conn = connect_to(&peer.addr)?;
    conn.wait_connection(WAIT).await?;

    let variable = SpecVariable::new("SETTLE", &conn);
    variable.set_value(SpecData::Int(5)).await?;
    let frame = expect(&mut peer, |m| m.cmd == Opcode::ChanSend).await;
    assert_eq!(frame.name, "var/SETTLE");
    assert_eq!(frame.data, SpecData::Int(5));
    Ok(())
}

#[tokio::test]
async fn operations_on_a_dead_connection_are_rejected() -> anyhow::Result<()> {
    // Nobody listens on the discard port on loopback.
    let conn = connect_to("127.0.0.1:9")?;
    match conn.send_command("date") {
        Err(SpecError::NotConnected) => {}
        other => panic!("expected NotConnected, got {other:?}"),
    }
    let channel = conn.get_channel("var/NOPE");
    match channel.read(Some(Duration::from_millis(50)), true).await {
        Err(SpecError::NotConnected) => {}
        other => panic!("expected NotConnected, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn deleted_events_merge_into_the_cache() -> anyhow::Result<()> {
    let initial = assoc(&[
        (
            "a",
            assoc(&[("k1", SpecData::Int(1)), ("k2", SpecData::Int(2))]),
        ),
        ("b", SpecData::Int(3)),
    ]);
    let removal = assoc(&[("a", assoc(&[("k1", SpecData::Null)])), ("b", SpecData::Null)]);
    let mut peer = spawn_peer(
        None,
        "fourc",
        PROTOCOL_VERSION,
        Box::new(move |msg| match msg.cmd {
            Opcode::Register if msg.name == "var/M" => {
                vec![Message::event("var/M", initial.clone(), false, None)]
            }
            Opcode::CmdWithReturn if msg.data == SpecData::Str("shrink".into()) => vec![
                Message::event("var/M", removal.clone(), true, None),
                Message::reply(msg.sn, SpecData::Null, None),
            ],
            _ => Vec::new(),
        }),
    )
    .await?;

    let conn = connect_to(&peer.addr)?;
    conn.wait_connection(WAIT).await?;

    let snapshots: Arc<Mutex<Vec<SpecData>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = snapshots.clone();
    let slot: Arc<Slot> = Arc::new(move |args| {
        if let Some(v) = args.first() {
            sink.lock().unwrap().push(v.clone());
        }
    });
    let channel = conn.register_channel("var/M", &slot, Registration::DoReg, DispatchMode::FireEvent);
    expect(&mut peer, |m| m.cmd == Opcode::Register && m.name == "var/M").await;

    conn.send_command_with_reply("shrink")?.wait(WAIT).await?;
    let expected = assoc(&[("a", assoc(&[("k2", SpecData::Int(2))]))]);
    assert_eq!(channel.value(), Some(expected.clone()));
    assert_eq!(snapshots.lock().unwrap().last(), Some(&expected));
    Ok(())
}

#[tokio::test]
async fn move_to_limit_waits_for_interpreter_readiness() -> anyhow::Result<()> {
    let ready = Arc::new(AtomicUsize::new(0));
    let ready_flag = ready.clone();
    let mut peer = spawn_peer(
        None,
        "fourc",
        PROTOCOL_VERSION,
        Box::new(move |msg| match msg.cmd {
            Opcode::ChanRead if msg.name == "status/ready" => vec![Message::reply(
                msg.sn,
                SpecData::Int(ready_flag.load(Ordering::SeqCst) as i32),
                None,
            )],
            Opcode::CmdWithReturn => vec![Message::reply(msg.sn, SpecData::Null, None)],
            _ => Vec::new(),
        }),
    )
    .await?;

    let conn = connect_to(&peer.addr)?;
    conn.wait_connection(WAIT).await?;
    let motor = SpecMotor::new("th", &conn);

    // Busy interpreter: the call is a silent no-op.
    motor.move_to_limit(true).await?;
    conn.send_command_with_reply("sync")?.wait(WAIT).await?;
    while let Ok(m) = peer.seen.try_recv() {
        assert_ne!(m.cmd, Opcode::Func, "limit run went out while busy");
    }

    // Idle interpreter: the limit run goes out.
    ready.store(1, Ordering::SeqCst);
    motor.move_to_limit(true).await?;
    let frame = expect(&mut peer, |m| m.cmd == Opcode::Func).await;
    assert_eq!(
        frame.data,
        SpecData::Array(vec![SpecData::Str("_mvc".into()), SpecData::Int(1)])
    );
    Ok(())
}

#[tokio::test]
async fn enumeration_uses_plain_commands() -> anyhow::Result<()> {
    let mut peer = spawn_peer(
        None,
        "fourc",
        PROTOCOL_VERSION,
        Box::new(|msg| match msg.cmd {
            Opcode::CmdWithReturn => {
                let mut outer = BTreeMap::new();
                for (i, (mne, name)) in [("tth", "TwoTheta"), ("th", "Theta")].iter().enumerate() {
                    let inner: BTreeMap<String, SpecData> =
                        [(mne.to_string(), SpecData::Str(name.to_string()))]
                            .into_iter()
                            .collect();
                    outer.insert(i.to_string(), SpecData::Assoc(inner));
                }
                vec![Message::reply(msg.sn, SpecData::Assoc(outer), None)]
            }
            _ => Vec::new(),
        }),
    )
    .await?;

    let conn = connect_to(&peer.addr)?;
    conn.wait_connection(WAIT).await?;
    let spec = spec_client::Spec::from_connection(&conn);
    assert_eq!(
        spec.motor_mnemonics().await?,
        vec!["tth".to_string(), "th".to_string()]
    );
    // Enumeration stays a text command even on new peers.
    expect(&mut peer, |m| m.cmd == Opcode::CmdWithReturn).await;
    Ok(())
}
