//! End-to-end sessions against a live server over loopback TCP.

mod common;

use std::io::{self, Write};
use std::time::{Duration, Instant};

use common::{NgClient, run_session, start_server, wait_for_idle_nails};
use nailgund::protocol::{CHUNK_EXIT, CHUNK_STDOUT, EXIT_EXCEPTION, EXIT_NO_SUCH_COMMAND};
use nailgund::{Nail, Server, ServerConfig};

fn register_test_nails(server: &Server) {
    let registry = server.registry();
    registry.register_aliased(
        "echo",
        Nail::contextual(|ctx| {
            let mut out = ctx.stdout();
            write!(
                out,
                "{}",
                ctx.args().first().map(String::as_str).unwrap_or("")
            )?;
            Ok(())
        }),
    );
    registry.register_aliased(
        "printenv",
        Nail::contextual(|ctx| {
            let mut out = ctx.stdout();
            for key in ["FOO", "BAZ"] {
                if let Some(value) = ctx.env_var(key) {
                    writeln!(out, "{key}={value}")?;
                }
            }
            Ok(())
        }),
    );
    registry.register_aliased(
        "pwd",
        Nail::contextual(|ctx| {
            let mut out = ctx.stdout();
            writeln!(out, "{}", ctx.working_dir().unwrap_or("(none)"))?;
            Ok(())
        }),
    );
    registry.register_aliased(
        "cat",
        Nail::contextual(|ctx| {
            io::copy(&mut ctx.stdin(), &mut ctx.stdout())?;
            Ok(())
        }),
    );
    registry.register_aliased("fail", Nail::contextual(|ctx| ctx.exit(7)));
    registry.register_aliased("boom", Nail::contextual(|_ctx| Err("kaboom".into())));
}

fn scenario_server(config: ServerConfig) -> (Server, std::net::SocketAddr) {
    let (server, addr) = start_server(config);
    register_test_nails(&server);
    (server, addr)
}

#[test]
fn echo_arg_emits_stdout_then_a_single_exit_chunk() {
    let (server, addr) = scenario_server(ServerConfig::default());

    let reply = run_session(addr, |client| {
        client.arg("hello").command("echo");
    });

    assert_eq!(
        reply.chunks,
        vec![
            (CHUNK_STDOUT, b"hello".to_vec()),
            (CHUNK_EXIT, b"0\n".to_vec()),
        ]
    );
    assert_eq!(reply.exit, Some(0));
    server.shutdown();
    server.join();
}

#[test]
fn env_pairs_reach_the_nail_in_last_wins_form() {
    let (server, addr) = scenario_server(ServerConfig::default());

    let reply = run_session(addr, |client| {
        client
            .arg("env")
            .env("FOO=bar")
            .env("BAZ=qux")
            .dir("/tmp")
            .command("printenv");
    });

    assert_eq!(reply.stdout, b"FOO=bar\nBAZ=qux\n");
    assert_eq!(reply.exit, Some(0));
    server.shutdown();
    server.join();
}

#[test]
fn working_directory_reaches_the_nail() {
    let (server, addr) = scenario_server(ServerConfig::default());

    let reply = run_session(addr, |client| {
        client.dir("/tmp").command("pwd");
    });

    assert_eq!(reply.stdout, b"/tmp\n");
    assert_eq!(reply.exit, Some(0));
    server.shutdown();
    server.join();
}

#[test]
fn stdin_chunks_are_copied_back_until_eof() {
    let (server, addr) = scenario_server(ServerConfig::default());

    let reply = run_session(addr, |client| {
        client
            .arg("-n")
            .command("cat")
            .stdin(b"abc")
            .stdin(b"def")
            .stdin_eof();
    });

    assert_eq!(reply.stdout, b"abcdef");
    assert_eq!(reply.exit, Some(0));
    server.shutdown();
    server.join();
}

#[test]
fn nail_requested_exit_status_is_reported() {
    let (server, addr) = scenario_server(ServerConfig::default());

    let reply = run_session(addr, |client| {
        client.command("fail");
    });

    assert_eq!(reply.chunks, vec![(CHUNK_EXIT, b"7\n".to_vec())]);
    assert_eq!(reply.exit, Some(7));
    server.shutdown();
    server.join();
}

#[test]
fn failing_nail_reports_the_exception_status() {
    let (server, addr) = scenario_server(ServerConfig::default());

    let reply = run_session(addr, |client| {
        client.command("boom");
    });

    assert_eq!(reply.exit, Some(EXIT_EXCEPTION));
    assert!(reply.stdout.is_empty());
    server.shutdown();
    server.join();
}

#[test]
fn silent_client_is_disconnected_after_the_heartbeat_timeout() {
    let timeout = Duration::from_millis(150);
    let (server, addr) = scenario_server(ServerConfig {
        heartbeat_timeout: timeout,
        ..ServerConfig::default()
    });

    let started = Instant::now();
    let reply = run_session(addr, |client| {
        client.command("cat");
        // No stdin, no eof, no heartbeat: the pending read must fail.
    });
    let elapsed = started.elapsed();

    assert!(
        elapsed < timeout * 2 + Duration::from_secs(1),
        "session lingered for {elapsed:?}"
    );
    assert_eq!(reply.exit, Some(EXIT_EXCEPTION));
    assert!(
        wait_for_idle_nails(&server, Duration::from_secs(2)),
        "nail_finished did not fire after the disconnect"
    );
    server.shutdown();
    server.join();
}

#[test]
fn heartbeats_keep_a_quiet_client_connected() {
    let (server, addr) = scenario_server(ServerConfig {
        heartbeat_timeout: Duration::from_millis(300),
        ..ServerConfig::default()
    });

    let mut client = NgClient::connect(addr);
    client.command("cat");
    for _ in 0..5 {
        std::thread::sleep(Duration::from_millis(100));
        client.heartbeat();
    }
    client.stdin(b"still here").stdin_eof();
    let reply = client.finish();

    assert_eq!(reply.stdout, b"still here");
    assert_eq!(reply.exit, Some(0));
    server.shutdown();
    server.join();
}

#[test]
fn unknown_commands_get_the_no_such_command_status() {
    let (server, addr) = scenario_server(ServerConfig::default());

    let reply = run_session(addr, |client| {
        client.command("definitely-not-registered");
    });

    assert_eq!(reply.exit, Some(EXIT_NO_SUCH_COMMAND));
    let stderr = String::from_utf8_lossy(&reply.stderr);
    assert!(
        stderr.contains("unknown command: definitely-not-registered"),
        "unexpected stderr: {stderr}"
    );
    server.shutdown();
    server.join();
}

#[test]
fn version_builtin_writes_through_the_routed_streams() {
    let (server, addr) = scenario_server(ServerConfig::default());

    let reply = run_session(addr, |client| {
        client.command("ng-version");
    });

    let stdout = String::from_utf8_lossy(&reply.stdout);
    assert!(
        stdout.starts_with("nailgund version "),
        "unexpected stdout: {stdout}"
    );
    assert_eq!(reply.exit, Some(0));
    server.shutdown();
    server.join();
}

#[test]
fn alias_builtin_lists_registered_aliases() {
    let (server, addr) = scenario_server(ServerConfig::default());

    let reply = run_session(addr, |client| {
        client.command("ng-alias");
    });

    let stdout = String::from_utf8_lossy(&reply.stdout);
    assert!(stdout.contains("echo\t"), "unexpected stdout: {stdout}");
    assert!(stdout.contains("ng-stop\t"), "unexpected stdout: {stdout}");
    assert_eq!(reply.exit, Some(0));
    server.shutdown();
    server.join();
}

#[test]
fn raw_nail_ids_resolve_when_enabled() {
    let (server, addr) = scenario_server(ServerConfig::default());

    let reply = run_session(addr, |client| {
        client.command("nailgund.builtins.Version");
    });

    assert_eq!(reply.exit, Some(0));
    let stdout = String::from_utf8_lossy(&reply.stdout);
    assert!(stdout.starts_with("nailgund version "));
    server.shutdown();
    server.join();
}

#[test]
fn stop_builtin_shuts_the_server_down() {
    let (server, addr) = scenario_server(ServerConfig::default());

    let reply = run_session(addr, |client| {
        client.command("ng-stop");
    });
    assert_eq!(reply.exit, Some(0));

    server.join();
    assert!(!server.is_running());
    assert_eq!(server.pool().live_workers(), 0);
}

#[test]
fn concurrent_sessions_do_not_mix_output() {
    let (server, addr) = scenario_server(ServerConfig::default());

    let handles: Vec<_> = (0..4)
        .map(|index| {
            std::thread::spawn(move || {
                let token = format!("session-{index}");
                let reply = run_session(addr, |client| {
                    client.arg(&token).command("echo");
                });
                (token, reply)
            })
        })
        .collect();

    for handle in handles {
        let (token, reply) = handle.join().expect("client thread");
        assert_eq!(reply.stdout, token.as_bytes(), "output crossed sessions");
        assert_eq!(reply.exit, Some(0));
    }
    assert!(
        wait_for_idle_nails(&server, Duration::from_secs(2)),
        "every nail_started must be paired with nail_finished"
    );
    server.shutdown();
    server.join();
}

#[test]
fn sessions_queue_when_the_live_worker_maximum_is_reached() {
    let (server, addr) = scenario_server(ServerConfig {
        max_live_sessions: 1,
        ..ServerConfig::default()
    });

    // First session holds the only worker until its stdin ends.
    let mut holder = NgClient::connect(addr);
    holder.command("cat").stdin(b"held");

    // Second session must wait for the worker, then complete normally.
    let waiter = std::thread::spawn(move || {
        run_session(addr, |client| {
            client.arg("queued").command("echo");
        })
    });

    std::thread::sleep(Duration::from_millis(200));
    holder.stdin_eof();
    let held = holder.finish();
    assert_eq!(held.stdout, b"held");
    assert_eq!(held.exit, Some(0));

    let queued = waiter.join().expect("queued client");
    assert_eq!(queued.stdout, b"queued");
    assert_eq!(queued.exit, Some(0));

    server.shutdown();
    server.join();
}
