// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use opentunnel::util;
use std::path::PathBuf;

use util::validators::{
  parse_endpoint, parse_hostname, parse_port, validate_endpoint, validate_hostname, validate_port,
};

mod client;
mod keys;
mod server;

const DEFAULT_BACKEND_PORT: u16 = 9001;

fn port_arg(name: &'static str, default: &'static str) -> Arg<'static> {
  Arg::new(name)
    .long(name)
    .validator(validate_port)
    .default_value(default)
    .takes_value(true)
}

fn bus_arg() -> Arg<'static> {
  Arg::new("bus")
    .help("Redis URL of the bus shared by frontends and backends")
    .long("bus")
    .short('s')
    .default_value("redis://127.0.0.1:6379")
    .takes_value(true)
}

fn port_value(args: &ArgMatches, name: &str) -> Result<u16> {
  parse_port(args.value_of(name).unwrap_or_default())
}

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,opentunnel=debug"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .arg(port_arg("port", "8080").short('p').help("Local service to expose when self-registering"))
    .arg(
      Arg::new("relay")
        .long("relay")
        .validator(validate_endpoint)
        .default_value("localhost:9001")
        .takes_value(true),
    )
    .arg(
      Arg::new("registrator")
        .long("registrator")
        .default_value("http://localhost:9006")
        .takes_value(true),
    )
    .arg(
      Arg::new("state-dir")
        .long("state-dir")
        .default_value(opentunnel::client::state::DEFAULT_STATE_DIR)
        .takes_value(true),
    )
    .subcommand(
      Command::new("frontend")
        .about("Accept public TLS connections and route them by server name")
        .arg(port_arg("port", "9000").short('p'))
        .arg(port_arg("http-port", "9005").visible_alias("ph"))
        .arg(bus_arg()),
    )
    .subcommand(
      Command::new("backend")
        .about("Accept authenticated client links and expose them on the bus")
        .arg(Arg::new("public-key").takes_value(true).required(true))
        .arg(port_arg("port", "9001").short('p'))
        .arg(bus_arg()),
    )
    .subcommand(
      Command::new("client")
        .about("Tunnel a local port through a relay")
        .arg(Arg::new("server").validator(validate_endpoint).takes_value(true).required(true))
        .arg(Arg::new("token").takes_value(true).required(true))
        .arg(port_arg("port", "443").short('p'))
        .arg(port_arg("http-port", "80").visible_alias("ph")),
    )
    .subcommand(
      Command::new("registrator")
        .about("Hand out hostnames under a base domain, signed with OPENTUNNEL_SIGNING_KEY")
        .arg(Arg::new("base-host").validator(validate_hostname).takes_value(true).required(true))
        .arg(port_arg("port", "9006").short('p')),
    )
    .subcommand(
      Command::new("relay")
        .about("Run a frontend and a backend in one process on an in-memory bus")
        .arg(Arg::new("public-key").takes_value(true).required(true))
        .arg(port_arg("port", "9000").short('p'))
        .arg(port_arg("http-port", "9005").visible_alias("ph"))
        .arg(port_arg("backend-port", "9001")),
    )
    .subcommand(
      Command::new("keygen")
        .about("Generate a signing key pair")
        .arg(Arg::new("path").takes_value(true).required(false)),
    )
    .subcommand(
      Command::new("token")
        .about("Mint an access token for a hostname with OPENTUNNEL_SIGNING_KEY")
        .arg(Arg::new("host").validator(validate_hostname).takes_value(true).required(true))
        .arg(
          Arg::new("expires")
            .help("Unix time in seconds after which the token is refused")
            .long("expires")
            .takes_value(true)
            .validator(|v| v.parse::<u32>().map(|_| ()).map_err(|e| e.to_string())),
        ),
    );
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("managed");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

pub fn managed_arg_handling(args: &'_ ArgMatches) -> Result<client::ManagedClientArgs> {
  Ok(client::ManagedClientArgs {
    port: port_value(args, "port")?,
    relay: parse_endpoint(args.value_of("relay").unwrap_or_default(), DEFAULT_BACKEND_PORT)?,
    registrator: args.value_of("registrator").unwrap_or_default().to_string(),
    state_dir: PathBuf::from(args.value_of("state-dir").unwrap_or_default()),
  })
}

pub fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  Ok(client::ClientArgs {
    server: parse_endpoint(args.value_of("server").unwrap_or_default(), DEFAULT_BACKEND_PORT)?,
    token: args.value_of("token").unwrap_or_default().to_string(),
    port: port_value(args, "port")?,
    http_port: port_value(args, "http-port")?,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("frontend", opts)) => {
      let config = server::FrontendArgs {
        port: port_value(opts, "port")?,
        http_port: port_value(opts, "http-port")?,
        bus_url: opts.value_of("bus").unwrap_or_default().to_string(),
      };
      tracing::info!("Running as frontend with config {:#?}", config);
      server::frontend_main(config).await
    }
    Some(("backend", opts)) => {
      let config = server::BackendArgs {
        public_key: opts.value_of("public-key").unwrap_or_default().to_string(),
        port: port_value(opts, "port")?,
        bus_url: opts.value_of("bus").unwrap_or_default().to_string(),
      };
      tracing::info!(port = config.port, bus = %config.bus_url, "Running as backend");
      server::backend_main(config).await
    }
    Some(("client", opts)) => {
      let config = client_arg_handling(opts)?;
      tracing::info!(server = %config.server, port = config.port, "Running as client");
      client::client_main(config).await
    }
    Some(("registrator", opts)) => {
      let config = server::RegistratorArgs {
        base_host: parse_hostname(opts.value_of("base-host").unwrap_or_default())?,
        port: port_value(opts, "port")?,
      };
      tracing::info!("Running as registrator with config {:#?}", config);
      server::registrator_main(config).await
    }
    Some(("relay", opts)) => {
      let config = server::RelayArgs {
        public_key: opts.value_of("public-key").unwrap_or_default().to_string(),
        port: port_value(opts, "port")?,
        http_port: port_value(opts, "http-port")?,
        backend_port: port_value(opts, "backend-port")?,
      };
      tracing::info!(port = config.port, backend_port = config.backend_port, "Running as relay");
      server::relay_main(config).await
    }
    Some(("keygen", opts)) => {
      keys::keygen_main(keys::KeygenArgs {
        output: opts.value_of("path").map(PathBuf::from),
      })
      .await
    }
    Some(("token", opts)) => {
      let expires_at = opts.value_of("expires").map(str::parse::<u32>).transpose()?;
      keys::token_main(keys::TokenArgs {
        host: parse_hostname(opts.value_of("host").unwrap_or_default())?,
        expires_at,
      })
      .await
    }
    Some((other, _)) => anyhow::bail!("Unknown subcommand {}", other),
    None => {
      let config = managed_arg_handling(matches)?;
      tracing::info!("Running as managed client with config {:#?}", config);
      client::managed_client_main(config).await
    }
  }
}
