use std::env;
use std::path::PathBuf;
use std::process;

use appfaders::{GainService, ServiceConfig};
use tracing::error;

fn usage() -> &'static str {
    "Usage: appfadersd [--socket-dir <dir>]\n\nRuns the gain service until killed."
}

fn main() {
    let mut config = ServiceConfig::from_env();
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--socket-dir" => match args.next() {
                Some(dir) => config = ServiceConfig::in_dir(PathBuf::from(dir)),
                None => {
                    eprintln!("appfadersd: --socket-dir needs a value");
                    process::exit(2);
                }
            },
            "--help" | "-h" => {
                println!("{}", usage());
                return;
            }
            other => {
                eprintln!("appfadersd: unknown argument '{other}'");
                process::exit(2);
            }
        }
    }

    appfaders::init_tracing();
    let service = GainService::new();
    match service.serve(&config) {
        Ok(handle) => handle.wait(),
        Err(err) => {
            error!(%err, "gain service failed to start");
            eprintln!("appfadersd: {err}");
            process::exit(1);
        }
    }
}
