mod commands;
mod reducers;

use std::fs::File;
use std::process::ExitCode;
use std::time::Instant;

use crossbeam_channel::{Receiver, TryRecvError};

use statesync_net::{
    LocalNetwork, MutationBus, ProcessLoop, SyncConfig, SyncCoordinator, SyncResult, SyncStatus,
    TcpHub, TcpLink,
};
use statesync_types::ProcessId;

use commands::Command;

const WORKER_ID: ProcessId = ProcessId::new(1);

const USAGE: &str = "\
usage: statesync <mode> [options]

modes:
  worker   [--bind ADDR]                 run the Worker and accept Renderers
  renderer --id N [--connect ADDR]       run a Renderer against a Worker
  demo     [--renderers N]               run a whole topology in-process

options:
  -v, --verbose                          debug logging";

fn init_logging(verbose: bool) {
    use simplelog::*;

    let log_level = if verbose { LevelFilter::Debug } else { LevelFilter::Warn };

    let log_path = dirs::config_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("statesync")
        .join("statesync.log");

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    match File::create(&log_path).or_else(|_| File::create(std::env::temp_dir().join("statesync.log"))) {
        Ok(file) => loggers.push(WriteLogger::new(log_level, Config::default(), file)),
        Err(e) => eprintln!("statesync: cannot create log file: {}", e),
    }
    if verbose {
        loggers.push(TermLogger::new(
            LevelFilter::Info,
            Config::default(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        ));
    }
    if let Err(e) = CombinedLogger::init(loggers) {
        eprintln!("statesync: failed to initialize logger: {}", e);
    }

    log::info!("statesync starting (log level: {:?})", log_level);
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");
    init_logging(verbose);

    let config = SyncConfig::load();
    let result = match args.get(1).map(String::as_str) {
        Some("worker") => run_worker(&args, &config),
        Some("renderer") => run_renderer(&args, &config),
        Some("demo") => run_demo(&args, &config),
        _ => {
            eprintln!("{}", USAGE);
            return ExitCode::from(2);
        }
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("statesync failed: {}", e);
            eprintln!("statesync: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_worker(args: &[String], config: &SyncConfig) -> SyncResult<bool> {
    let addr = flag_value(args, "--bind").unwrap_or(&config.bind_addr);
    let (hub, inbox) = TcpHub::bind(WORKER_ID, addr, config.max_frame_bytes)?;
    println!("worker {} listening on {}", WORKER_ID, hub.local_addr()?);

    let replica = reducers::demo_replica(WORKER_ID);
    let mut process = ProcessLoop::new(SyncCoordinator::worker(replica, hub, config), inbox);
    interact(&mut process);
    Ok(true)
}

fn run_renderer(args: &[String], config: &SyncConfig) -> SyncResult<bool> {
    let Some(id) = flag_value(args, "--id").and_then(|s| s.parse::<u64>().ok()) else {
        eprintln!("renderer needs --id N (N > 1)\n\n{}", USAGE);
        return Ok(false);
    };
    let id = ProcessId::new(id);
    if id == WORKER_ID {
        eprintln!("process id {} is reserved for the worker", WORKER_ID);
        return Ok(false);
    }
    let addr = flag_value(args, "--connect").unwrap_or(&config.bind_addr);
    let (link, inbox) = TcpLink::connect(id, WORKER_ID, addr, config.max_frame_bytes)?;
    println!("renderer {} connected to {}", id, addr);

    let replica = reducers::demo_replica(id);
    let coordinator = SyncCoordinator::renderer(replica, WORKER_ID, link, config);
    let mut process = ProcessLoop::new(coordinator, inbox);
    process.start();
    interact(&mut process);
    Ok(true)
}

/// Drive `process` while executing commands from stdin.
fn interact<B: MutationBus>(process: &mut ProcessLoop<B>) {
    println!("{}", commands::HELP);
    let input = commands::spawn_stdin_reader();
    let mut status = process.coordinator().status();

    loop {
        process.run_once();

        let now = process.coordinator().status();
        if now != status {
            println!("[{}] {:?}", process.coordinator().id(), now);
            status = now;
        }

        if !execute_pending(process, &input) {
            break;
        }
    }
    process.coordinator_mut().shutdown();
}

/// Returns false once the user quit or stdin closed.
fn execute_pending<B: MutationBus>(process: &mut ProcessLoop<B>, input: &Receiver<Command>) -> bool {
    loop {
        let command = match input.try_recv() {
            Ok(command) => command,
            Err(TryRecvError::Empty) => return true,
            Err(TryRecvError::Disconnected) => return false,
        };
        let coordinator = process.coordinator_mut();
        match command {
            Command::Commit { kind, payload } => match coordinator.commit(&kind, payload) {
                Ok(id) => println!("committed {} {}", kind, id),
                Err(e) if e.is_soft() => println!("not committed: {}", e),
                Err(e) => println!("rejected: {}", e),
            },
            Command::State => match coordinator.replica().to_json() {
                Ok(json) => println!("{}", json),
                Err(e) => println!("cannot serialize state: {}", e),
            },
            Command::Status => println!(
                "{} {} {:?}, {} peers",
                coordinator.role(),
                coordinator.id(),
                coordinator.status(),
                coordinator.peers().count()
            ),
            Command::Help => println!("{}", commands::HELP),
            Command::Quit => return false,
        }
    }
}

/// Worker, N Renderers and one Renderer hosting a webview on an in-process
/// network. Commits round-robin and reports whether every replica converged.
fn run_demo(args: &[String], config: &SyncConfig) -> SyncResult<bool> {
    let renderers = flag_value(args, "--renderers")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(2)
        .clamp(1, 16);

    let net = LocalNetwork::new();
    let mut processes = Vec::new();

    let (bus, inbox) = net.connect(WORKER_ID);
    let worker = SyncCoordinator::worker(reducers::demo_replica(WORKER_ID), bus, config);
    processes.push(ProcessLoop::new(worker, inbox));

    // The last Renderer hosts a webview.
    let host = ProcessId::new(1 + renderers);
    let webview_id = ProcessId::new(100);
    for n in 0..renderers {
        let id = ProcessId::new(2 + n);
        let (bus, inbox) = net.connect(id);
        let mut renderer = SyncCoordinator::renderer(reducers::demo_replica(id), WORKER_ID, bus, config);
        if id == host {
            renderer = renderer.hosting(webview_id);
        }
        processes.push(ProcessLoop::new(renderer, inbox));
    }

    let (bus, inbox) = net.connect(webview_id);
    let webview = SyncCoordinator::webview(reducers::demo_replica(webview_id), host, WORKER_ID, bus, config);
    processes.push(ProcessLoop::new(webview, inbox));

    for process in processes.iter_mut() {
        process.start();
    }
    settle(&mut processes);

    let count = processes.len();
    for round in 0..3 * count {
        let process = &mut processes[round % count];
        let result = if round % 2 == 0 {
            process.coordinator_mut().commit("counter/increment", serde_json::json!({"by": round}))
        } else {
            process
                .coordinator_mut()
                .commit("todos/add", serde_json::json!({"text": format!("item {}", round)}))
        };
        if let Err(e) = result {
            println!("{} could not commit: {}", process.coordinator().id(), e);
        }
        // Every other round, let traffic interleave with further commits.
        if round % 2 == 1 {
            for process in processes.iter_mut() {
                process.turn(Instant::now());
            }
        }
    }
    settle(&mut processes);

    let reference = processes[0].coordinator().replica().to_json()?;
    let mut converged = true;
    for process in &processes {
        let coordinator = process.coordinator();
        let state = coordinator.replica().to_json()?;
        let same = state == reference;
        converged &= same;
        println!(
            "{:>11} {:>4} {:?} {}",
            coordinator.role().to_string(),
            coordinator.id().to_string(),
            coordinator.status(),
            if same { "converged" } else { "DIVERGED" }
        );
    }
    println!("{}", reference);
    Ok(converged)
}

/// Turn every process until two rounds in a row are quiet. A batch flushed
/// during a round is only read in the next one.
fn settle<B: MutationBus>(processes: &mut [ProcessLoop<B>]) {
    let mut quiet_rounds = 0;
    for _ in 0..1000 {
        let mut handled = 0;
        for process in processes.iter_mut() {
            handled += process.turn(Instant::now());
        }
        let pending = processes
            .iter()
            .any(|p| p.coordinator().batcher().is_scheduled() || p.coordinator().status() == SyncStatus::Syncing);
        if handled == 0 && !pending {
            quiet_rounds += 1;
            if quiet_rounds == 2 {
                return;
            }
        } else {
            quiet_rounds = 0;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    log::warn!("demo topology did not settle");
}
