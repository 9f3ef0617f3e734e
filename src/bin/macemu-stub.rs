//! Stand-in for `qemu-system-ppc` that only implements the monitor socket.
//!
//! Accepts the same command line as the real emulator, ignores everything but
//! `-monitor unix:<path>,server,nowait`, and answers the handful of monitor
//! commands `macemu` sends. Extra switches shape test scenarios:
//!
//! * `--ignore-quit`: acknowledge `quit` but keep running.
//! * `--startup-delay-ms <n>`: wait before opening the monitor socket.
//! * `--exit-after-ms <n>`: exit with status 3 after `n` ms.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const BANNER: &str = "QEMU 8.2.0 monitor - type 'help' for more information\r\n";
const PROMPT: &str = "(qemu) ";

struct Options {
    monitor: PathBuf,
    ignore_quit: bool,
    startup_delay: Duration,
    exit_after: Option<Duration>,
}

fn parse_args() -> Option<Options> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut monitor = None;
    let mut ignore_quit = false;
    let mut startup_delay = Duration::ZERO;
    let mut exit_after = None;

    let mut i = 0;
    while i < args.len() {
        let next = args.get(i + 1);
        match args[i].as_str() {
            "-monitor" => {
                let spec = next?.strip_prefix("unix:")?;
                monitor = Some(PathBuf::from(first_option(spec)));
                i += 1;
            }
            "--ignore-quit" => ignore_quit = true,
            "--startup-delay-ms" => {
                startup_delay = Duration::from_millis(next?.parse().ok()?);
                i += 1;
            }
            "--exit-after-ms" => {
                exit_after = Some(Duration::from_millis(next?.parse().ok()?));
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }

    Some(Options {
        monitor: monitor?,
        ignore_quit,
        startup_delay,
        exit_after,
    })
}

/// First comma-separated field of a QEMU option value, with `,,` unescaped.
fn first_option(value: &str) -> String {
    let mut out = String::new();
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ',' {
            if chars.peek() != Some(&',') {
                break;
            }
            chars.next();
        }
        out.push(c);
    }
    out
}

fn serve(stream: UnixStream, paused: &AtomicBool, ignore_quit: bool) -> io::Result<()> {
    let mut writer = stream.try_clone()?;
    writer.write_all(BANNER.as_bytes())?;
    writer.write_all(PROMPT.as_bytes())?;

    for line in BufReader::new(stream).lines() {
        let line = line?;
        let cmd = line.trim();
        write!(writer, "{cmd}\r\n")?;

        let reply = match cmd.split_once(' ').map_or((cmd, ""), |(c, a)| (c, a)) {
            ("quit", _) => {
                if !ignore_quit {
                    std::process::exit(0);
                }
                String::new()
            }
            ("stop", _) => {
                paused.store(true, Ordering::SeqCst);
                String::new()
            }
            ("cont", _) => {
                paused.store(false, Ordering::SeqCst);
                String::new()
            }
            ("system_reset", _) => String::new(),
            ("info", "status") => {
                if paused.load(Ordering::SeqCst) {
                    "VM status: paused\r\n".to_string()
                } else {
                    "VM status: running\r\n".to_string()
                }
            }
            ("screendump", path) => {
                // 2x2 black PPM.
                let mut ppm = b"P6\n2 2\n255\n".to_vec();
                ppm.extend_from_slice(&[0u8; 12]);
                match std::fs::write(path, ppm) {
                    Ok(()) => String::new(),
                    Err(e) => format!("Could not open '{path}': {e}\r\n"),
                }
            }
            ("device_add", _) | ("device_del", _) => String::new(),
            _ => format!("unknown command: '{cmd}'\r\n"),
        };

        writer.write_all(reply.as_bytes())?;
        writer.write_all(PROMPT.as_bytes())?;
    }
    Ok(())
}

fn run(opts: Options) -> io::Result<()> {
    if let Some(after) = opts.exit_after {
        thread::spawn(move || {
            thread::sleep(after);
            std::process::exit(3);
        });
    }

    thread::sleep(opts.startup_delay);

    let _ = std::fs::remove_file(&opts.monitor);
    let listener = UnixListener::bind(&opts.monitor)?;
    let paused = Arc::new(AtomicBool::new(false));

    for stream in listener.incoming() {
        let stream = stream?;
        let paused = Arc::clone(&paused);
        let ignore_quit = opts.ignore_quit;
        thread::spawn(move || {
            if let Err(e) = serve(stream, &paused, ignore_quit) {
                eprintln!("macemu-stub: connection error: {e}");
            }
        });
    }
    Ok(())
}

fn main() {
    let Some(opts) = parse_args() else {
        eprintln!("macemu-stub: missing -monitor unix:<path>,server,nowait");
        std::process::exit(2);
    };
    if let Err(e) = run(opts) {
        eprintln!("macemu-stub: io error: {e}");
        std::process::exit(1);
    }
}
