use clap::{App, Arg, ArgMatches};
use hearth::logging;
use larder::clock::Clock;
use larder::context::Shared;
use larder::net::dispatch::{self, AcceptGate, Dispatcher};
use larder::net::worker::Worker;
use larder::settings::Settings;
use larder::store::{Cache, CacheConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

const EX_USAGE: i32 = 64;
const EX_NOUSER: i32 = 67;
const EX_OSERR: i32 = 71;

fn main() {
    std::process::exit(run());
}

fn app() -> App<'static, 'static> {
    App::new("larderd")
        .version(larder::VERSION)
        .about("Runs the larder cache daemon.")
        .arg(
            Arg::with_name("port")
                .short("p")
                .value_name("NUM")
                .help("TCP port number to listen on (default: 11211)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("udp-port")
                .short("U")
                .value_name("NUM")
                .help("UDP port number to listen on (default: 11211, 0 is off)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("socket")
                .short("s")
                .value_name("FILE")
                .help("unix socket path to listen on (disables network support)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("access")
                .short("a")
                .value_name("MASK")
                .help("access mask for the unix socket, in octal (default: 0700)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("inter")
                .short("l")
                .value_name("ADDR")
                .help("interface to listen on, default is all addresses")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("memory")
                .short("m")
                .value_name("MB")
                .help("max memory to use for items in megabytes (default: 64)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("no-evict")
                .short("M")
                .help("return error on memory exhausted rather than evicting items"),
        )
        .arg(
            Arg::with_name("conns")
                .short("c")
                .value_name("NUM")
                .help("max simultaneous connections (default: 1024)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("threads")
                .short("t")
                .value_name("NUM")
                .help("number of worker threads (default: 4)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("reqs")
                .short("R")
                .value_name("NUM")
                .help("requests served per connection per event (default: 20)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("factor")
                .short("f")
                .value_name("FACTOR")
                .help("slab class growth factor (default: 1.25)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("chunk-size")
                .short("n")
                .value_name("BYTES")
                .help("minimum space allocated for key+value+flags (default: 48)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("prealloc")
                .short("L")
                .help("preallocate the initial slab page of every class"),
        )
        .arg(Arg::with_name("no-cas").short("C").help("disable CAS tokens"))
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("verbose output (repeat for more)"),
        )
        .arg(
            Arg::with_name("pidfile")
                .short("P")
                .value_name("FILE")
                .help("save PID in FILE")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("user")
                .short("u")
                .value_name("USER")
                .help("assume identity of USER (only when run as root)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .help("read settings from a TOML file; flags override it")
                .takes_value(true),
        )
}

fn build_settings(matches: &ArgMatches) -> Result<Settings, String> {
    let mut settings: Settings = match matches.value_of("config") {
        Some(path) => serdeconv::from_toml_file(path)
            .map_err(|err| format!("Error reading config file: {}", err))?,
        None => Settings::default(),
    };

    fn parse<T: std::str::FromStr>(value: &str, what: &str) -> Result<T, String> {
        value.parse().map_err(|_| format!("bad value for {}", what))
    }

    if let Some(v) = matches.value_of("port") {
        settings.port = parse(v, "-p")?;
    }
    if let Some(v) = matches.value_of("udp-port") {
        settings.udp_port = parse(v, "-U")?;
    }
    if let Some(v) = matches.value_of("socket") {
        settings.socket_path = Some(PathBuf::from(v));
    }
    if let Some(v) = matches.value_of("access") {
        settings.access =
            u32::from_str_radix(v, 8).map_err(|_| "bad value for -a".to_string())?;
    }
    if let Some(v) = matches.value_of("inter") {
        settings.inter = Some(v.to_string());
    }
    if let Some(v) = matches.value_of("memory") {
        let megabytes: usize = parse(v, "-m")?;
        settings.max_bytes = megabytes * 1024 * 1024;
    }
    if matches.is_present("no-evict") {
        settings.evict_to_free = false;
    }
    if let Some(v) = matches.value_of("conns") {
        settings.max_conns = parse(v, "-c")?;
    }
    if let Some(v) = matches.value_of("threads") {
        settings.num_threads = parse(v, "-t")?;
    }
    if let Some(v) = matches.value_of("reqs") {
        settings.reqs_per_event = parse(v, "-R")?;
    }
    if let Some(v) = matches.value_of("factor") {
        settings.factor = parse(v, "-f")?;
    }
    if let Some(v) = matches.value_of("chunk-size") {
        settings.chunk_size = parse(v, "-n")?;
    }
    if matches.is_present("prealloc") {
        settings.preallocate = true;
    }
    if matches.is_present("no-cas") {
        settings.use_cas = false;
    }
    if matches.occurrences_of("verbose") > 0 {
        settings.verbose = matches.occurrences_of("verbose").min(255) as u8;
    }
    if let Some(v) = matches.value_of("pidfile") {
        settings.pid_file = Some(PathBuf::from(v));
    }
    if let Some(v) = matches.value_of("user") {
        settings.user = Some(v.to_string());
    }

    if settings.factor <= 1.0 {
        return Err("factor must be greater than 1.0".to_string());
    }
    if settings.num_threads == 0 {
        return Err("number of threads must be greater than 0".to_string());
    }
    if settings.reqs_per_event == 0 {
        return Err("number of requests per event must be greater than 0".to_string());
    }
    Ok(settings)
}

fn run() -> i32 {
    let matches = match app().get_matches_safe() {
        Ok(matches) => matches,
        Err(err) => {
            eprintln!("{}", err);
            return EX_USAGE;
        }
    };
    let settings = match build_settings(&matches) {
        Ok(settings) => settings,
        Err(msg) => {
            eprintln!("{}", msg);
            return EX_USAGE;
        }
    };

    let log = logging::init(settings.verbose);

    // Broken pipes surface as EPIPE write errors, not signals.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    // Leave headroom for the listeners and notification plumbing on top
    // of the connection budget.
    unsafe {
        let mut rlim: libc::rlimit = std::mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) == 0 {
            let want = (settings.max_conns + 3) as libc::rlim_t;
            if rlim.rlim_cur < want {
                rlim.rlim_cur = want;
                if rlim.rlim_max < want {
                    rlim.rlim_max = want;
                }
                if libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) != 0 {
                    eprintln!(
                        "failed to set rlimit for open files. Try running as root or requesting a smaller maxconns value."
                    );
                    return EX_OSERR;
                }
            }
        }
    }

    if unsafe { libc::getuid() } == 0 || unsafe { libc::geteuid() } == 0 {
        match &settings.user {
            None => {
                eprintln!("can't run as root without the -u switch");
                return EX_USAGE;
            }
            Some(user) => {
                if let Err(code) = assume_identity(user) {
                    return code;
                }
            }
        }
    }

    let clock = Arc::new(Clock::new());
    let cache = Arc::new(Cache::new(
        CacheConfig::from_settings(&settings),
        clock,
        &log,
    ));
    let _maintenance = Cache::spawn_maintenance(&cache);
    let shared = Arc::new(Shared::new(Arc::clone(&cache), settings.clone()));

    let listeners = match dispatch::bind_listeners(&settings, &log) {
        Ok(listeners) => listeners,
        Err(err) => {
            logging::crit!(log, "failed to bind listeners"; "error" => %err);
            return EX_OSERR;
        }
    };

    let udp_socket = if settings.udp_port != 0 && settings.socket_path.is_none() {
        let host = settings.inter.as_deref().unwrap_or("::");
        match std::net::UdpSocket::bind((host, settings.udp_port)) {
            Ok(socket) => Some(socket),
            Err(err) => {
                logging::crit!(log, "failed to bind udp socket"; "error" => %err);
                return EX_OSERR;
            }
        }
    } else {
        None
    };

    let (gate, gate_registration) = AcceptGate::new();
    let mut intakes = Vec::new();
    for id in 0..settings.num_threads {
        let udp = match &udp_socket {
            Some(socket) => match socket.try_clone() {
                Ok(clone) => Some(clone),
                Err(err) => {
                    logging::crit!(log, "failed to clone udp socket"; "error" => %err);
                    return EX_OSERR;
                }
            },
            None => None,
        };

        let worker = match Worker::new(id, Arc::clone(&shared), Arc::clone(&gate), udp, &log) {
            Ok(worker) => worker,
            Err(err) => {
                logging::crit!(log, "failed to start worker"; "worker" => id, "error" => %err);
                return EX_OSERR;
            }
        };
        intakes.push(worker.intake());

        let spawned = thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || worker.run());
        if spawned.is_err() {
            logging::crit!(log, "failed to spawn worker thread"; "worker" => id);
            return EX_OSERR;
        }
    }

    if let Some(path) = &settings.pid_file {
        if let Err(err) = std::fs::write(path, format!("{}\n", std::process::id())) {
            logging::warn!(log, "could not save PID file";
                           "path" => %path.display(), "error" => %err);
        }
    }

    let mut dispatcher =
        match Dispatcher::new(shared, listeners, intakes, gate, gate_registration, &log) {
            Ok(dispatcher) => dispatcher,
            Err(err) => {
                logging::crit!(log, "failed to start dispatcher"; "error" => %err);
                return EX_OSERR;
            }
        };

    dispatcher.run();
    0
}

fn assume_identity(user: &str) -> Result<(), i32> {
    let name = match std::ffi::CString::new(user) {
        Ok(name) => name,
        Err(_) => {
            eprintln!("can't find the user {} to switch to", user);
            return Err(EX_NOUSER);
        }
    };

    let pw = unsafe { libc::getpwnam(name.as_ptr()) };
    if pw.is_null() {
        eprintln!("can't find the user {} to switch to", user);
        return Err(EX_NOUSER);
    }

    let (uid, gid) = unsafe { ((*pw).pw_uid, (*pw).pw_gid) };
    if unsafe { libc::setgid(gid) } < 0 || unsafe { libc::setuid(uid) } < 0 {
        eprintln!("failed to assume identity of user {}", user);
        return Err(EX_OSERR);
    }
    Ok(())
}
