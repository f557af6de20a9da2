// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::process;
use std::sync::Mutex;
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_json::Value;
use slog::{o, Drain, Level, LevelFilter, Logger};

use fast_jsonrpc::client;
use fast_jsonrpc::SessionConfig;

static APP: &'static str = "rpccall";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 2030;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for making a JSON-RPC method call")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("method")
                .help("Name of remote RPC method call")
                .long("method")
                .short("m")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("args")
                .help("JSON-encoded params for RPC method call")
                .long("args")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Milliseconds to wait for a response before giving up")
                .long("timeout")
                .short("t")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .takes_value(false),
        )
        .get_matches()
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());

    let level = if matches.is_present("verbose") {
        Level::Debug
    } else {
        Level::Warning
    };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!(),
    );

    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to parse host and port as valid socket address: \
                 {}",
                e
            );
            process::exit(1)
        });
    let method =
        String::from(matches.value_of("method").unwrap_or_else(|| {
            eprintln!("Failed to parse method argument as String");
            process::exit(1)
        }));
    let params = if matches.is_present("args") {
        Some(value_t!(matches, "args", Value).unwrap_or_else(|e| e.exit()))
    } else {
        None
    };
    let timeout = value_t!(matches, "timeout", u64)
        .ok()
        .map(Duration::from_millis);

    let client = client::connect(&addr, SessionConfig::default(), Some(&log))
        .await
        .unwrap_or_else(|e| {
            eprintln!("Failed to connect to server: {}", e);
            process::exit(1)
        });

    let result = client.call(&method, params, timeout).await;
    client.shutdown().await;

    match result {
        Ok(value) => println!("{}", value),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1)
        }
    }
}
