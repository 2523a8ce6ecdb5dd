use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use nailgund::server::DEFAULT_PORT;
use nailgund::{Server, ServerConfig};

struct CliOptions {
    config: ServerConfig,
    debug_events_dir: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_family = "unix")]
    // Session workers write to sockets whose peers can vanish at any time.
    // Ignore SIGPIPE so a dead client surfaces as a broken-pipe error on
    // the session instead of killing the whole server.
    ignore_sigpipe();
    nailgund::diagnostics::startup_log("main: entry");

    let options = parse_cli_args()?;
    let server = Server::new(options.config);
    nailgund::event_log::initialize(
        options.debug_events_dir,
        serde_json::to_value(server.config())?,
    )?;

    let addr = server.start()?;
    eprintln!("nailgund: listening on {addr}");
    server.join();
    eprintln!("nailgund: stopped");
    Ok(())
}

#[cfg(target_family = "unix")]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn parse_cli_args() -> Result<CliOptions, Box<dyn std::error::Error>> {
    let mut parser = ArgParser::new();
    let mut config = ServerConfig::default();
    let mut debug_events_dir = None;

    while let Some(arg) = parser.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--bind" => {
                let value = parser.next_value("--bind")?;
                config.bind = parse_bind(&value)?;
            }
            _ if arg.starts_with("--bind=") => {
                config.bind = parse_bind(flag_value(&arg, "--bind")?)?;
            }
            "--port" => {
                let value = parser.next_value("--port")?;
                config.bind.set_port(value.parse()?);
            }
            _ if arg.starts_with("--port=") => {
                config.bind.set_port(flag_value(&arg, "--port")?.parse()?);
            }
            "--heartbeat-timeout-ms" => {
                let value = parser.next_value("--heartbeat-timeout-ms")?;
                config.heartbeat_timeout = parse_timeout_ms(&value)?;
            }
            _ if arg.starts_with("--heartbeat-timeout-ms=") => {
                config.heartbeat_timeout =
                    parse_timeout_ms(flag_value(&arg, "--heartbeat-timeout-ms")?)?;
            }
            "--pool-size" => {
                let value = parser.next_value("--pool-size")?;
                config.pool_capacity = value.parse()?;
            }
            _ if arg.starts_with("--pool-size=") => {
                config.pool_capacity = flag_value(&arg, "--pool-size")?.parse()?;
            }
            "--max-sessions" => {
                let value = parser.next_value("--max-sessions")?;
                config.max_live_sessions = parse_max_sessions(&value)?;
            }
            _ if arg.starts_with("--max-sessions=") => {
                config.max_live_sessions =
                    parse_max_sessions(flag_value(&arg, "--max-sessions")?)?;
            }
            "--no-raw-names" => {
                config.allow_raw_nail_names = false;
            }
            "--debug-events-dir" => {
                let value = parser.next_value("--debug-events-dir")?;
                if value.trim().is_empty() {
                    return Err("missing value for --debug-events-dir".into());
                }
                debug_events_dir = Some(PathBuf::from(value));
            }
            _ if arg.starts_with("--debug-events-dir=") => {
                debug_events_dir = Some(PathBuf::from(flag_value(&arg, "--debug-events-dir")?));
            }
            _ => return Err(format!("unknown argument: {arg}").into()),
        }
    }

    Ok(CliOptions {
        config,
        debug_events_dir,
    })
}

fn flag_value<'a>(arg: &'a str, flag: &str) -> Result<&'a str, Box<dyn std::error::Error>> {
    let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
    if value.is_empty() {
        return Err(format!("missing value for {flag}").into());
    }
    Ok(value)
}

fn parse_bind(raw: &str) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    // A bare address gets the default port.
    if let Ok(ip) = raw.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }
    Err(format!("invalid --bind value: {raw} (expected ip or ip:port)").into())
}

fn parse_timeout_ms(raw: &str) -> Result<Duration, Box<dyn std::error::Error>> {
    let millis: u64 = raw.parse()?;
    if millis == 0 {
        return Err("--heartbeat-timeout-ms must be positive".into());
    }
    Ok(Duration::from_millis(millis))
}

fn parse_max_sessions(raw: &str) -> Result<usize, Box<dyn std::error::Error>> {
    let value: usize = raw.parse()?;
    if value == 0 {
        return Err("--max-sessions must be positive".into());
    }
    Ok(value)
}

struct ArgParser {
    args: Vec<String>,
    index: usize,
}

impl ArgParser {
    fn new() -> Self {
        Self {
            args: std::env::args().skip(1).collect(),
            index: 0,
        }
    }

    fn next(&mut self) -> Option<String> {
        let value = self.args.get(self.index)?.clone();
        self.index += 1;
        Some(value)
    }

    fn next_value(&mut self, flag: &str) -> Result<String, Box<dyn std::error::Error>> {
        self.next()
            .ok_or_else(|| format!("missing value for {flag}").into())
    }
}

fn print_usage() {
    println!(
        "Usage:\n\
nailgund [--bind <ip[:port]>] [--port <port>] [--heartbeat-timeout-ms <ms>] [--pool-size <n>] [--max-sessions <n>] [--no-raw-names] [--debug-events-dir <dir>]\n\n\
--bind: listen address (default: 127.0.0.1:{DEFAULT_PORT})\n\
--port: listen port, keeping the bind address\n\
--heartbeat-timeout-ms: silence tolerated on an open stdin before the client is considered gone (default: 10000)\n\
--pool-size: idle session workers kept for reuse (default: 10)\n\
--max-sessions: maximum concurrent sessions (default: 64)\n\
--no-raw-names: resolve commands through aliases only\n\
--debug-events-dir: directory for per-startup JSONL event logs (env: NAILGUND_DEBUG_EVENTS_DIR)\n\n\
Stop a running server with the built-in ng-stop command."
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bind_accepts_full_and_bare_addresses() {
        let full = parse_bind("0.0.0.0:4000").expect("full address");
        assert_eq!(full, "0.0.0.0:4000".parse().unwrap());

        let bare = parse_bind("127.0.0.1").expect("bare address");
        assert_eq!(bare.port(), DEFAULT_PORT);

        assert!(parse_bind("not-an-address").is_err());
    }

    #[test]
    fn parse_timeout_rejects_zero() {
        assert!(parse_timeout_ms("0").is_err());
        assert_eq!(
            parse_timeout_ms("2500").expect("timeout"),
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn parse_max_sessions_rejects_zero() {
        assert!(parse_max_sessions("0").is_err());
        assert_eq!(parse_max_sessions("8").expect("sessions"), 8);
    }
}
