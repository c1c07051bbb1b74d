use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::Parser;
use socket2::Socket;

use zprt::config::RING_ENTRIES;
use zprt::metrics;
use zprt::ring::Ring;
use zprt::transport;
use zprt::tun::TunDevice;
use zprt::tunnel::Tunnel;

#[derive(Parser)]
#[command(
    name = "zprt",
    version,
    about = "Point-to-point Layer-3 tunnel over a stream socket",
    group(clap::ArgGroup::new("mode").required(true).args(["bind", "connect"]))
)]
struct Args {
    /// TUN device name; templates like tun%d are allowed
    #[arg(short = 'n', long = "ifname")]
    ifname: String,

    /// Device MTU
    #[arg(short = 'm', long = "mtu", value_parser = clap::value_parser!(u32).range(68..=65535))]
    mtu: u32,

    /// Inner CIDR, e.g. 10.0.0.1/24
    #[arg(short = 'a', long = "addr")]
    cidr: String,

    /// Bind address host:port (server mode)
    #[arg(short = 'b', long = "bind")]
    bind: Option<String>,

    /// Connect address host:port (client mode)
    #[arg(short = 'c', long = "connect")]
    connect: Option<String>,

    /// SOCKS5 proxy hop, may be repeated; applied left-to-right
    #[arg(short = 'p', long = "proxy")]
    proxies: Vec<String>,

    /// Seconds between reconnect attempts (client)
    #[arg(short = 'r', long = "reconnect-delay", default_value_t = 5)]
    reconnect_delay: u64,

    /// Consecutive connection errors before giving up (client, 0 = unlimited)
    #[arg(short = 'e', long = "max-errors", default_value_t = 0)]
    max_errors: u32,
}

/// The only process-wide state: flipped by the signal handler, read by the
/// accept/reconnect loops. The tunnel worker never touches it.
static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_: libc::c_int) {
    RUNNING.store(false, Ordering::Release);
}

fn install_signal_handlers() {
    // SAFETY: standard sigaction setup; the handler only stores an atomic.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // No SA_RESTART: blocking accept/connect must return EINTR so the
        // loops observe the running flag.
        sa.sa_flags = 0;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
}

fn main() {
    install_signal_handlers();
    metrics::spawn_reporter();
    let args = Args::parse();

    let mut tun = TunDevice::open(&args.ifname).expect("failed to open TUN device");
    tun.set_mtu(args.mtu).expect("failed to set MTU");
    tun.set_cidr(&args.cidr).expect("failed to set inner address");
    tun.set_up().expect("failed to bring the device up");
    eprintln!(
        "zprt: {} up, mtu {}, index {}",
        tun.name(),
        tun.mtu(),
        tun.index()
    );

    let result = match (&args.bind, &args.connect) {
        (Some(bind), _) => serve(&tun, bind),
        (_, Some(target)) => client(&tun, target, &args),
        _ => unreachable!("clap enforces exactly one mode"),
    };
    result.expect("fatal error");
}

fn serve(tun: &TunDevice, bind: &str) -> io::Result<()> {
    let listener = transport::listen(bind)?;
    eprintln!("zprt: listening on {bind}");

    while RUNNING.load(Ordering::Acquire) {
        let peer = match transport::accept(&listener) {
            Ok(peer) => peer,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        run_connection(tun, peer);
    }
    Ok(())
}

fn client(tun: &TunDevice, target: &str, args: &Args) -> io::Result<()> {
    let mut errors: u32 = 0;

    while RUNNING.load(Ordering::Acquire) {
        match transport::connect_chain(&args.proxies, target) {
            Ok(peer) => {
                // A successful connect starts a fresh error budget.
                errors = 0;
                if !run_connection(tun, peer) {
                    errors += 1;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                eprintln!("connect to {target} failed: {e}");
                errors += 1;
            }
        }

        if args.max_errors != 0 && errors >= args.max_errors {
            eprintln!("giving up after {errors} consecutive errors");
            break;
        }
        if !RUNNING.load(Ordering::Acquire) {
            break;
        }

        metrics::inc_reconnect();
        eprintln!("reconnecting in {}s ...", args.reconnect_delay);
        thread::sleep(Duration::from_secs(args.reconnect_delay));
    }
    Ok(())
}

/// One connection, one ring, one worker. Returns true on a clean close.
fn run_connection(tun: &TunDevice, peer: Socket) -> bool {
    let ring = match Ring::open(RING_ENTRIES) {
        Ok(ring) => ring,
        Err(e) => {
            eprintln!("ring setup failed: {e:?}");
            return false;
        }
    };
    let tunnel = match Tunnel::new(ring, tun, peer) {
        Ok(tunnel) => tunnel,
        Err(e) => {
            eprintln!("tunnel setup failed: {e:?}");
            return false;
        }
    };

    let result = thread::scope(|scope| {
        thread::Builder::new()
            .name("tunnel".into())
            .spawn_scoped(scope, || tunnel.run())
            .expect("failed to spawn tunnel worker")
            .join()
    });

    match result {
        Ok(Ok(())) => {
            eprintln!("connection closed");
            true
        }
        Ok(Err(e)) => {
            eprintln!("tunnel error: {e:?}");
            false
        }
        Err(_) => {
            eprintln!("tunnel worker panicked");
            false
        }
    }
}
