use bavy_machine::demo::{DemoConfig, DemoSystem, DEMO_SYSTEM};
use bavy_machine::logsink::log_sink;
use bavy_machine::{Machine, MachineOptions, QuantumScheduler, VirtualTime};
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON options file; command line flags override its values
    #[arg(long)]
    options: Option<PathBuf>,

    /// Stop after this many seconds of emulated time (0 runs forever)
    #[arg(long)]
    seconds: Option<u64>,

    /// Root directory for save states
    #[arg(long)]
    state_dir: Option<PathBuf>,

    #[arg(long)]
    nvram_dir: Option<PathBuf>,

    #[arg(long)]
    cfg_dir: Option<PathBuf>,

    /// Save state to load once the machine is running
    #[arg(long)]
    state: Option<String>,

    /// Restore the `auto` state on start and write it on exit
    #[arg(long)]
    autosave: bool,

    /// Append session diagnostics to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    no_watchdog: bool,

    /// Make the demo processor stop servicing the watchdog after this many
    /// milliseconds
    #[arg(long, value_name = "MS")]
    hang: Option<u64>,
}

fn print_section(title: &str) {
    println!("\n\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
    println!("\x1b[1;33m  ▸ {}\x1b[0m", title);
    println!("\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
}

fn print_status(component: &str, status: &str, ok: bool) {
    let status_color = if ok { "\x1b[1;32m" } else { "\x1b[1;31m" };
    let check = if ok { "✓" } else { "✗" };
    println!("    \x1b[0;37m{:<40}\x1b[0m {}[{}] {}\x1b[0m", component, status_color, check, status);
}

fn print_info(key: &str, value: &str) {
    println!("    \x1b[0;90m├─\x1b[0m \x1b[0;37m{:<20}\x1b[0m \x1b[1;97m{}\x1b[0m", key, value);
}

fn build_options(args: &Args) -> Result<MachineOptions, Box<dyn std::error::Error>> {
    let mut options = match &args.options {
        Some(path) => MachineOptions::load(path)?,
        None => MachineOptions::default(),
    };
    if let Some(seconds) = args.seconds {
        options.seconds_to_run = seconds;
    }
    if let Some(dir) = &args.state_dir {
        options.state_directory = dir.clone();
    }
    if let Some(dir) = &args.nvram_dir {
        options.nvram_directory = dir.clone();
    }
    if let Some(dir) = &args.cfg_dir {
        options.cfg_directory = dir.clone();
    }
    if args.state.is_some() {
        options.state = args.state.clone();
    }
    if args.log_file.is_some() {
        options.log_file = args.log_file.clone();
    }
    options.autosave |= args.autosave;
    options.verbose |= args.verbose;
    if args.no_watchdog {
        options.watchdog = false;
    }
    Ok(options)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let options = build_options(&args)?;

    print_section("SESSION");
    print_info("System", DEMO_SYSTEM);
    print_info("State directory", &options.state_directory.display().to_string());
    print_info("NVRAM directory", &options.nvram_directory.display().to_string());
    print_info(
        "Run time",
        &match options.seconds_to_run {
            0 => "unlimited".to_string(),
            s => format!("{} s", s),
        },
    );
    print_info("Watchdog", if options.watchdog { "enabled" } else { "disabled" });

    let config = DemoConfig {
        hang_after: args.hang.map(VirtualTime::from_millis),
    };

    let mut first_run = true;
    let code = loop {
        let system = DemoSystem::new(config.clone());
        let view = system.view();
        let mut machine = Machine::new(
            Box::new(system),
            Box::new(QuantumScheduler::new()),
            options.clone(),
        )?
        .with_log_sink(log_sink());

        let code = machine.run(first_run);
        for message in machine.take_messages() {
            print_info("Message", &message);
        }

        let cpu = view.cpu.get();
        print_section("RUN SUMMARY");
        print_info("Emulated time", &machine.now().to_string());
        print_info("CPU cycles", &cpu.cycles.to_string());
        print_info("Frames", &view.frames.get().to_string());
        print_info("Boot count", &view.boots.get().to_string());
        print_status("Session", &format!("EXIT {}", code), code == 0);

        if code != 0 || !machine.hard_reset_pending() {
            break code;
        }
        log::info!("[Main] Hard reset requested, rebuilding the machine");
        first_run = false;
    };

    std::process::exit(code);
}
