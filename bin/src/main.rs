use clap::{Arg, ArgMatches};

fn main() {
    env_logger::init();
    let args = clap::App::new("tracer-inject")
        .arg(
            Arg::with_name("pid")
                .index(1)
                .required(true)
                .help("Id of the process to inject to")
        )
        .arg(
            Arg::with_name("module")
                .short("m")
                .long("module")
                .takes_value(true)
                .required_unless("probe")
                .help("Path of the module the injected thunk loads")
        )
        .arg(
            Arg::with_name("function")
                .short("f")
                .long("function")
                .default_value("InjectionEntry")
                .help("Export of the module to call with the payload")
        )
        .arg(
            Arg::with_name("payload")
                .short("p")
                .long("payload")
                .takes_value(true)
                .help("File copied next to the thunk and passed to the function")
        )
        .arg(
            Arg::with_name("probe")
                .long("probe")
                .help("Only check that the injected code runs and returns the sentinel")
        )
        .arg(
            Arg::with_name("sentinel")
                .long("sentinel")
                .takes_value(true)
                .help("Hex value the probe expects back")
        )
        .arg(
            Arg::with_name("writable_pages")
                .long("writable-pages")
                .default_value("0")
                .help("Read/write pages to reserve after the data page")
        )
        .arg(
            Arg::with_name("timeout")
                .short("t")
                .long("timeout")
                .takes_value(true)
                .help("Milliseconds to wait for the remote thread")
        )
        .arg(
            Arg::with_name("no_wait")
                .long("no-wait")
                .conflicts_with("probe")
                .help("Return once the remote thread has started")
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .help("Print details about steps being taken")
        )
        .get_matches();

    if let Err(e) = run(&args) {
        println!("{}", e);
        std::process::exit(1);
    }
}

fn parse_number<T: std::str::FromStr>(args: &ArgMatches, name: &str) -> Result<Option<T>, String> {
    match args.value_of(name) {
        Some(s) => s.parse().map(Some).map_err(|_| format!("Invalid {}: {}", name, s)),
        None => Ok(None),
    }
}

fn parse_sentinel(args: &ArgMatches) -> Result<Option<u32>, String> {
    match args.value_of("sentinel") {
        Some(s) => {
            let digits = s.trim_start_matches("0x");
            u32::from_str_radix(digits, 16)
                .map(Some)
                .map_err(|_| format!("Invalid sentinel: {}", s))
        }
        None => Ok(None),
    }
}

#[cfg(not(all(windows, target_arch = "x86_64")))]
fn run(args: &ArgMatches) -> Result<(), String> {
    parse_number::<u32>(args, "pid")?;
    parse_sentinel(args)?;
    Err("Injection is only supported on 64-bit Windows".into())
}

#[cfg(all(windows, target_arch = "x86_64"))]
fn run(args: &ArgMatches) -> Result<(), String> {
    use std::time::Duration;

    use tracer_inject::thunk::{
        injection_thunk, probe_local_entry, ThunkTemplate, DEFAULT_PROBE_SENTINEL,
    };
    use tracer_inject::win::{LocalCode, WinProcess};
    use tracer_inject::{InjectionRequest, Injector, StagingOptions};

    let verbose = args.is_present("verbose");
    let pid = parse_number::<u32>(args, "pid")?.ok_or("No pid")?;
    let sentinel = parse_sentinel(args)?.unwrap_or(DEFAULT_PROBE_SENTINEL);
    let timeout = parse_number::<u64>(args, "timeout")?.map(Duration::from_millis);
    let options = StagingOptions {
        writable_pages: parse_number(args, "writable_pages")?.unwrap_or(0),
    };
    let entry = injection_thunk as usize as u64;

    if verbose { println!("Probing the thunk locally..."); }
    unsafe { probe_local_entry(injection_thunk, sentinel) }
        .map_err(|e| format!("Local probe failed: {}", e))?;

    let process = WinProcess::open(pid).map_err(|e| e.to_string())?;
    let code = LocalCode::new().map_err(|e| e.to_string())?;
    let injector = Injector::new(&code, &process);

    if args.is_present("probe") {
        if verbose { println!("Probing process {} with sentinel {:#x}", pid, sentinel); }
        injector.probe(entry, sentinel, timeout, options)
            .map_err(|e| format!("Probe failed: {}", e))?;
        println!("Probe of process {} succeeded", pid);
        return Ok(());
    }

    let module = args.value_of("module").ok_or("No module")?;
    let function = args.value_of("function").ok_or("No function")?;
    let payload = match args.value_of_os("payload") {
        Some(path) => std::fs::read(path)
            .map_err(|e| format!("Could not read {}: {}", path.to_string_lossy(), e))?,
        None => Vec::new(),
    };
    let primitives = process.bootstrap_primitives()
        .map_err(|e| format!("Could not resolve bootstrap functions: {}", e))?;
    if verbose { println!("Bootstrap functions: {:#x?}", primitives); }
    let template = ThunkTemplate::bootstrap(module, function, primitives)
        .map_err(|e| e.to_string())?;
    let request = InjectionRequest::new(&template)
        .payload(&payload)
        .options(options);
    let mut injection = injector.inject(entry, request)
        .map_err(|e| format!("Error injecting: {}", e))?;
    if verbose {
        println!(
            "Thread {} started at {:#x}, payload at {:#x}",
            injection.thread.id(), injection.entry_address, injection.payload_address,
        );
        if let Some(address) = injection.writable_address {
            println!("{} writable pages at {:#x}", injection.writable_pages, address);
        }
    }
    if args.is_present("no_wait") {
        return Ok(());
    }
    match injection.thread.wait(timeout).map_err(|e| e.to_string())? {
        Some(code) => {
            match tracer_inject::RemoteExitCode::from_code(code) {
                Some(error) => return Err(format!("Remote thread failed: {}", error)),
                None => println!("Remote thread exited with {:#x}", code),
            }
        }
        None => println!("Remote thread is still running"),
    }
    Ok(())
}
