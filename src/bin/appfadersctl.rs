use std::env;
use std::path::PathBuf;
use std::process;

use appfaders::discovery::{AppEvent, ApplicationRoster};
use appfaders::{ClientConfig, ClientError, GainClient, ServiceConfig};

const USAGE: &str = "Usage: appfadersctl [--socket-dir <dir>] <command>

Commands:
  set <app-id> <gain>     store a gain between 0.0 and 1.0
  get <app-id>            print the gain (1.0 when never set)
  rm <app-id>             forget the gain
  list                    print every stored gain
  console [--app <id>]... interactive console; --app adds a candidate row

Without a command the console launches.";

fn fail(err: impl std::fmt::Display) -> ! {
    eprintln!("appfadersctl: {err}");
    process::exit(1);
}

fn usage_error(message: &str) -> ! {
    eprintln!("appfadersctl: {message}\n\n{USAGE}");
    process::exit(2);
}

fn connect(service: &ServiceConfig) -> GainClient {
    match GainClient::connect(&ClientConfig::for_service(service)) {
        Ok(client) => client,
        Err(err @ ClientError::Unreachable { .. }) => {
            fail(format!("{err}\nis appfadersd running?"))
        }
        Err(err) => fail(err),
    }
}

fn main() {
    let mut service = ServiceConfig::from_env();
    let mut rest = Vec::new();
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--socket-dir" => match args.next() {
                Some(dir) => service = ServiceConfig::in_dir(PathBuf::from(dir)),
                None => usage_error("--socket-dir needs a value"),
            },
            "--help" | "-h" => {
                println!("{USAGE}");
                return;
            }
            _ => rest.push(arg),
        }
    }

    appfaders::init_tracing();
    let mut rest = rest.into_iter();
    let command = rest.next().unwrap_or_else(|| "console".to_string());
    match command.as_str() {
        "set" => {
            let (Some(app_id), Some(gain)) = (rest.next(), rest.next()) else {
                usage_error("set needs <app-id> <gain>");
            };
            let Ok(gain) = gain.parse::<f32>() else {
                usage_error("gain must be a number");
            };
            if let Err(err) = connect(&service).set_gain(&app_id, gain) {
                fail(err);
            }
        }
        "get" => {
            let Some(app_id) = rest.next() else {
                usage_error("get needs <app-id>");
            };
            match connect(&service).get_gain(&app_id) {
                Ok(gain) => println!("{gain:.3}"),
                Err(err) => fail(err),
            }
        }
        "rm" => {
            let Some(app_id) = rest.next() else {
                usage_error("rm needs <app-id>");
            };
            if let Err(err) = connect(&service).remove_gain(&app_id) {
                fail(err);
            }
        }
        "list" => match connect(&service).all_gains() {
            Ok(gains) => {
                let mut gains: Vec<_> = gains.into_iter().collect();
                gains.sort_by(|a, b| a.0.cmp(&b.0));
                for (app_id, gain) in gains {
                    println!("{gain:.3}  {app_id}");
                }
            }
            Err(err) => fail(err),
        },
        "console" => {
            let roster = ApplicationRoster::new();
            while let Some(flag) = rest.next() {
                match (flag.as_str(), rest.next()) {
                    ("--app", Some(app_id)) => roster.apply(&AppEvent::launched(app_id)),
                    _ => usage_error("console accepts only --app <id>"),
                }
            }
            let client = connect(&service);
            if let Err(err) = appfaders::control::ui::run(client, roster) {
                fail(err);
            }
        }
        other => usage_error(&format!("unknown command '{other}'")),
    }
}
